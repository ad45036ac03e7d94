use crate::block::{
    BlockAllocError, BlockAllocation, CompactBlockInfo, PopResult, PushResult, TrimColor,
};
use crate::config;
use crate::layout;
use crate::notifier::MemoryNotifier;
use crate::platform;
use crate::queue::IndexQueue;
use crate::sync::RecursiveMutex;
use crate::util::{
    abort_with_message, align_down, align_up, DEFAULT_QUARANTINE_RATIO, PAGE_SIZE, SHADOW_RATIO,
    SLAB_SIZE,
};
use core::cell::UnsafeCell;

/// The state of one slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlabState {
    Free,
    Allocated,
    Quarantined,
}

/// Per-slab record: the state plus the descriptor of the allocation that
/// currently occupies it (empty while Free).
#[derive(Clone, Copy)]
struct SlabInfo {
    state: SlabState,
    info: CompactBlockInfo,
}

/// Mutable heap state, all of it under the heap lock.
struct ZebraInner {
    /// One record per slab; the single source of truth for slab states.
    slabs: *mut SlabInfo,
    slabs_mapped: usize,
    /// Indices of Free slabs, FIFO.
    free_slabs: IndexQueue,
    /// Indices of Quarantined slabs, FIFO.
    quarantine: IndexQueue,
    /// Fraction of the reservation the quarantine may hold.
    quarantine_ratio: f32,
    /// Precomputed ⌊quarantine_ratio * slab_count⌋ so the hot path never
    /// compares floats.
    max_quarantined_slabs: usize,
}

/// A guard-page heap for single-page allocations.
///
/// The reservation is divided into slabs of two pages: an even page that
/// holds the allocation and an odd page that is kept inaccessible.
///
/// ```text
/// +-----------+-----------+-----------+-----------+-- - -
/// | even page | guard     | even page | guard     |  ...
/// +-----------+-----------+-----------+-----------+-- - -
/// \-------- slab 0 -------/\-------- slab 1 ------/
/// ```
///
/// Allocations are placed at the end of the even page so that running off
/// the end of the buffer faults immediately. Freed blocks can be routed
/// through a FIFO quarantine, bounded by a configurable fraction of the
/// reservation; a quarantined slab's even page is guarded as well, so
/// use-after-free accesses fault until the slab is recycled.
///
/// All public operations serialize on one recursive lock; the quarantine
/// push/pop pair may re-enter it.
pub struct ZebraBlockHeap<'n> {
    /// Reservation start. Page-aligned, immutable.
    base: *mut u8,
    /// Reservation length, a multiple of the slab size.
    heap_size: usize,
    slab_count: usize,
    lock: RecursiveMutex,
    inner: UnsafeCell<ZebraInner>,
    /// Telemetry sink. Has its own locking; must not call back into the
    /// heap.
    notifier: &'n dyn MemoryNotifier,
}

unsafe impl Send for ZebraBlockHeap<'_> {}
// All mutable state is behind `lock`; the immutable fields are shared
// freely.
unsafe impl Sync for ZebraBlockHeap<'_> {}

impl<'n> ZebraBlockHeap<'n> {
    /// The largest raw allocation `allocate` serves.
    pub const MAX_ALLOCATION_SIZE: usize = crate::util::MAX_RAW_ALLOCATION_SIZE;

    /// The largest block body `allocate_block` serves.
    pub const MAX_BLOCK_ALLOCATION_SIZE: usize = crate::util::MAX_BLOCK_ALLOCATION_SIZE;

    /// Reserve `heap_size` bytes (rounded down to a whole number of slabs)
    /// and guard every odd page. Returns None when the reservation or the
    /// metadata mappings fail; aborts if a guard page cannot be protected.
    pub fn new(heap_size: usize, notifier: &'n dyn MemoryNotifier) -> Option<ZebraBlockHeap<'n>> {
        let heap_size = align_down(heap_size, SLAB_SIZE);
        if heap_size == 0 {
            return None;
        }
        let slab_count = heap_size / SLAB_SIZE;

        let base = unsafe { platform::map_anonymous(heap_size) };
        if base.is_null() {
            return None;
        }

        // Guard every odd page up front. A guard that cannot be protected
        // would silently disable overflow detection, so it is fatal.
        for i in 0..slab_count {
            let odd_page = unsafe { base.add(i * SLAB_SIZE + PAGE_SIZE) };
            if !unsafe { platform::protect_none(odd_page, PAGE_SIZE) } {
                abort_with_message("zebraheap: cannot protect guard page\n");
            }
        }

        // Slab records and queues are mapped separately so heap metadata
        // never lives inside the reservation it describes.
        let slabs_mapped = align_up(slab_count * core::mem::size_of::<SlabInfo>(), PAGE_SIZE);
        let slabs = unsafe { platform::map_anonymous(slabs_mapped) } as *mut SlabInfo;
        if slabs.is_null() {
            unsafe { platform::unmap(base, heap_size) };
            return None;
        }
        for i in 0..slab_count {
            unsafe {
                slabs.add(i).write(SlabInfo {
                    state: SlabState::Free,
                    info: CompactBlockInfo::empty(),
                })
            };
        }

        let release = |slabs: *mut SlabInfo| unsafe {
            platform::unmap(slabs as *mut u8, slabs_mapped);
            platform::unmap(base, heap_size);
        };

        let mut free_slabs = match IndexQueue::with_capacity(slab_count) {
            Some(q) => q,
            None => {
                release(slabs);
                return None;
            }
        };
        for i in 0..slab_count {
            let pushed = free_slabs.push(i);
            debug_assert!(pushed);
        }
        let quarantine = match IndexQueue::with_capacity(slab_count) {
            Some(q) => q,
            None => {
                release(slabs);
                return None;
            }
        };

        notifier.notify_reservation(base, heap_size);
        notifier.notify_internal_use(slabs as *const u8, slabs_mapped);
        let (ptr, len) = free_slabs.storage();
        notifier.notify_internal_use(ptr, len);
        let (ptr, len) = quarantine.storage();
        notifier.notify_internal_use(ptr, len);

        let ratio = DEFAULT_QUARANTINE_RATIO;
        Some(ZebraBlockHeap {
            base,
            heap_size,
            slab_count,
            lock: RecursiveMutex::new(),
            inner: UnsafeCell::new(ZebraInner {
                slabs,
                slabs_mapped,
                free_slabs,
                quarantine,
                quarantine_ratio: ratio,
                max_quarantined_slabs: Self::quarantine_slab_cap(ratio, slab_count),
            }),
            notifier,
        })
    }

    /// Construct from `ZEBRAHEAP_*` environment variables.
    pub fn new_from_config(notifier: &'n dyn MemoryNotifier) -> Option<ZebraBlockHeap<'n>> {
        // The heap is built once at startup; getenv is fine here.
        unsafe { config::read_config() };
        let heap = Self::new(config::heap_size(), notifier)?;
        heap.set_quarantine_ratio(config::quarantine_ratio());
        Some(heap)
    }

    // ========================================================================
    // Heap interface
    // ========================================================================

    /// Allocate `bytes` so that the buffer ends exactly at the slab's guard
    /// page: `ptr + bytes` is the first unreadable byte. The pointer is only
    /// as aligned as `bytes` makes it; callers that need alignment use
    /// `allocate_block`.
    pub fn allocate(&self, bytes: u32) -> Option<*mut u8> {
        if bytes == 0 || bytes as usize > Self::MAX_ALLOCATION_SIZE {
            return None;
        }
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = self.allocate_impl(inner, bytes);
        self.lock.unlock();
        result
    }

    fn allocate_impl(&self, inner: &mut ZebraInner, bytes: u32) -> Option<*mut u8> {
        let index = inner.free_slabs.pop()?;
        let alloc = unsafe { self.slab_address(index).add(PAGE_SIZE - bytes as usize) };
        let slab = unsafe { &mut *inner.slabs.add(index) };
        slab.state = SlabState::Allocated;
        slab.info = CompactBlockInfo {
            header: alloc,
            body: alloc,
            body_size: bytes,
            block_size: bytes,
        };
        self.debug_check(inner);
        Some(alloc)
    }

    /// Release an allocation. `alloc` must be the exact pointer a slab was
    /// served at; interior pointers, foreign addresses and quarantined slabs
    /// all return false without mutating anything. Quarantined memory leaves
    /// the heap through `pop`, never through `free`.
    pub fn free(&self, alloc: *const u8) -> bool {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = self.free_impl(inner, alloc);
        self.lock.unlock();
        result
    }

    fn free_impl(&self, inner: &mut ZebraInner, alloc: *const u8) -> bool {
        let index = match self.slab_index(alloc) {
            Some(i) => i,
            None => return false,
        };
        let slab = unsafe { &mut *inner.slabs.add(index) };
        if slab.info.header != alloc as *mut u8 {
            return false;
        }
        if slab.state != SlabState::Allocated {
            return false;
        }
        slab.state = SlabState::Free;
        slab.info = CompactBlockInfo::empty();
        let pushed = inner.free_slabs.push(index);
        debug_assert!(pushed);
        self.debug_check(inner);
        true
    }

    /// True iff `alloc` is the exact header address of an Allocated slab.
    pub fn is_allocated(&self, alloc: *const u8) -> bool {
        self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        let result = match self.slab_index(alloc) {
            Some(index) => {
                let slab = unsafe { &*inner.slabs.add(index) };
                slab.state == SlabState::Allocated && slab.info.header == alloc as *mut u8
            }
            None => false,
        };
        self.lock.unlock();
        result
    }

    /// Total block size of the allocation at `alloc`, or None if `alloc` is
    /// not the exact header address of an Allocated slab.
    pub fn allocation_size(&self, alloc: *const u8) -> Option<u32> {
        self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        let result = match self.slab_index(alloc) {
            Some(index) => {
                let slab = unsafe { &*inner.slabs.add(index) };
                if slab.state == SlabState::Allocated && slab.info.header == alloc as *mut u8 {
                    Some(slab.info.block_size)
                } else {
                    None
                }
            }
            None => None,
        };
        self.lock.unlock();
        result
    }

    // ========================================================================
    // Block heap interface
    // ========================================================================

    /// Allocate a block of `size` body bytes with the body pushed against
    /// the guard page. The body start is aligned down to the shadow ratio,
    /// so up to `SHADOW_RATIO - 1` bytes of trailer padding may separate the
    /// body end from the guard page; bodies whose size is a multiple of the
    /// shadow ratio end exactly at it.
    pub fn allocate_block(
        &self,
        size: u32,
        min_left_rz: u32,
        min_right_rz: u32,
    ) -> Result<BlockAllocation, BlockAllocError> {
        if size == 0 || size as usize > Self::MAX_BLOCK_ALLOCATION_SIZE {
            return Err(BlockAllocError::TooLarge);
        }
        let layout = layout::plan_block_layout(size, min_left_rz, min_right_rz, SHADOW_RATIO)
            .ok_or(BlockAllocError::TooLarge)?;
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = self.allocate_block_impl(inner, layout);
        self.lock.unlock();
        result
    }

    fn allocate_block_impl(
        &self,
        inner: &mut ZebraInner,
        layout: layout::BlockLayout,
    ) -> Result<BlockAllocation, BlockAllocError> {
        let index = inner
            .free_slabs
            .pop()
            .ok_or(BlockAllocError::OutOfCapacity)?;
        let block = self.slab_address(index);
        let body = unsafe { block.add(layout.body_offset()) };
        let slab = unsafe { &mut *inner.slabs.add(index) };
        slab.state = SlabState::Allocated;
        slab.info = CompactBlockInfo {
            header: block,
            body,
            body_size: layout.body_size,
            block_size: layout.block_size,
        };
        self.debug_check(inner);
        Ok(BlockAllocation {
            block,
            body,
            layout,
        })
    }

    /// Release a block allocation. The descriptor must match the slab's
    /// record exactly.
    pub fn free_block(&self, info: &CompactBlockInfo) -> bool {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = match self.slab_index(info.header) {
            Some(index) => {
                let matches = {
                    let slab = unsafe { &*inner.slabs.add(index) };
                    slab.info == *info
                };
                matches && self.free_impl(inner, info.header)
            }
            None => false,
        };
        self.lock.unlock();
        result
    }

    // ========================================================================
    // Quarantine interface
    // ========================================================================

    /// Move an Allocated slab into the quarantine and guard its even page.
    /// On success the result is always `SyncTrimRequired`: this quarantine
    /// trims synchronously, and the caller must invoke `pop` before
    /// completing the operation.
    pub fn push(&self, info: &CompactBlockInfo) -> PushResult {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = self.push_impl(inner, info);
        self.lock.unlock();
        result
    }

    fn push_impl(&self, inner: &mut ZebraInner, info: &CompactBlockInfo) -> PushResult {
        let index = match self.slab_index(info.header) {
            Some(i) => i,
            None => return PushResult::Rejected,
        };
        let slab = unsafe { &mut *inner.slabs.add(index) };
        if slab.state != SlabState::Allocated || slab.info != *info {
            return PushResult::Rejected;
        }
        slab.state = SlabState::Quarantined;
        // The even page stays guarded for as long as the slab sits in the
        // quarantine; stale pointers into the freed block fault.
        if !unsafe { platform::protect_none(self.slab_address(index), PAGE_SIZE) } {
            abort_with_message("zebraheap: cannot protect quarantined page\n");
        }
        let pushed = inner.quarantine.push(index);
        debug_assert!(pushed);
        self.debug_check(inner);
        PushResult::SyncTrimRequired
    }

    /// Evict the oldest quarantined slab if the quarantine exceeds its ratio
    /// bound, returning its descriptor tagged Green. Returns None once the
    /// bound holds (or the quarantine is empty). Because a push grows the
    /// quarantine by exactly one slab, a single pop after each push is
    /// enough to keep the bound.
    pub fn pop(&self) -> Option<PopResult> {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let result = self.pop_impl(inner);
        self.lock.unlock();
        result
    }

    fn pop_impl(&self, inner: &mut ZebraInner) -> Option<PopResult> {
        if inner.quarantine.len() <= inner.max_quarantined_slabs {
            return None;
        }
        let index = inner.quarantine.pop()?;
        let info = self.release_quarantined(inner, index);
        self.debug_check(inner);
        Some(PopResult {
            info,
            color: TrimColor::Green,
        })
    }

    /// Drain the quarantine in FIFO order regardless of the ratio bound and
    /// return the evicted descriptors.
    pub fn empty(&self) -> Vec<CompactBlockInfo> {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let mut infos = Vec::with_capacity(inner.quarantine.len());
        while let Some(index) = inner.quarantine.pop() {
            infos.push(self.release_quarantined(inner, index));
        }
        self.debug_check(inner);
        self.lock.unlock();
        infos
    }

    /// Return a quarantined slab to the free list. Caller holds the lock and
    /// has already dequeued `index`.
    fn release_quarantined(&self, inner: &mut ZebraInner, index: usize) -> CompactBlockInfo {
        let slab = unsafe { &mut *inner.slabs.add(index) };
        debug_assert_eq!(slab.state, SlabState::Quarantined);
        let info = slab.info;
        slab.state = SlabState::Free;
        slab.info = CompactBlockInfo::empty();
        let even_page = self.slab_address(index);
        // The page must be writable again before the slab can be served.
        if !unsafe { platform::protect_read_write(even_page, PAGE_SIZE) } {
            abort_with_message("zebraheap: cannot unprotect recycled page\n");
        }
        // The stale contents are dead; let the kernel reclaim the page.
        unsafe { platform::advise_free(even_page, PAGE_SIZE) };
        let pushed = inner.free_slabs.push(index);
        debug_assert!(pushed);
        info
    }

    /// Current quarantine ratio.
    pub fn quarantine_ratio(&self) -> f32 {
        self.lock.lock();
        let ratio = unsafe { &*self.inner.get() }.quarantine_ratio;
        self.lock.unlock();
        ratio
    }

    /// Set the fraction of the reservation the quarantine may hold. Does not
    /// trim; a lowered bound takes effect on the next push/pop pair.
    pub fn set_quarantine_ratio(&self, ratio: f32) {
        debug_assert!((0.0..=1.0).contains(&ratio));
        let ratio = ratio.clamp(0.0, 1.0);
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        inner.quarantine_ratio = ratio;
        inner.max_quarantined_slabs = Self::quarantine_slab_cap(ratio, self.slab_count);
        self.lock.unlock();
    }

    /// Shard id for `info`. This quarantine is unsharded; every descriptor
    /// maps to shard 0 and the shard locks are no-ops. The heap lock
    /// already serializes push and pop.
    pub fn quarantine_lock_id(&self, _info: &CompactBlockInfo) -> usize {
        0
    }

    pub fn lock_quarantine(&self, _id: usize) {}

    pub fn unlock_quarantine(&self, _id: usize) {}

    // ========================================================================
    // Locking and introspection
    // ========================================================================

    /// Acquire the heap lock. The lock is recursive, so public operations
    /// stay callable while it is held.
    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    /// Reservation start.
    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn free_count(&self) -> usize {
        self.lock.lock();
        let count = unsafe { &*self.inner.get() }.free_slabs.len();
        self.lock.unlock();
        count
    }

    pub fn quarantined_count(&self) -> usize {
        self.lock.lock();
        let count = unsafe { &*self.inner.get() }.quarantine.len();
        self.lock.unlock();
        count
    }

    pub fn allocated_count(&self) -> usize {
        self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        let count = self.slab_count - inner.free_slabs.len() - inner.quarantine.len();
        self.lock.unlock();
        count
    }

    // ========================================================================
    // Slab arithmetic
    // ========================================================================

    /// Index of the slab containing `addr`, or None if `addr` is outside
    /// the reservation.
    fn slab_index(&self, addr: *const u8) -> Option<usize> {
        let addr = addr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.heap_size {
            return None;
        }
        Some((addr - base) / SLAB_SIZE)
    }

    /// Address of slab `index`. `index` must be in range.
    fn slab_address(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.slab_count);
        unsafe { self.base.add(index * SLAB_SIZE) }
    }

    fn quarantine_slab_cap(ratio: f32, slab_count: usize) -> usize {
        (ratio as f64 * slab_count as f64) as usize
    }

    /// Verify that the slab table and the queues agree. Debug builds only;
    /// the scan is linear in the slab count.
    #[cfg(debug_assertions)]
    fn debug_check(&self, inner: &ZebraInner) {
        let mut free = 0usize;
        let mut quarantined = 0usize;
        let mut allocated = 0usize;
        for i in 0..self.slab_count {
            match unsafe { (*inner.slabs.add(i)).state } {
                SlabState::Free => free += 1,
                SlabState::Allocated => allocated += 1,
                SlabState::Quarantined => quarantined += 1,
            }
        }
        debug_assert_eq!(free + allocated + quarantined, self.slab_count);
        debug_assert_eq!(free, inner.free_slabs.len());
        debug_assert_eq!(quarantined, inner.quarantine.len());
        for index in inner.free_slabs.iter() {
            debug_assert_eq!(unsafe { (*inner.slabs.add(index)).state }, SlabState::Free);
        }
        for index in inner.quarantine.iter() {
            debug_assert_eq!(
                unsafe { (*inner.slabs.add(index)).state },
                SlabState::Quarantined
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn debug_check(&self, _inner: &ZebraInner) {}
}

impl Drop for ZebraBlockHeap<'_> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let free_storage = inner.free_slabs.storage();
        let quarantine_storage = inner.quarantine.storage();
        let slabs = inner.slabs;
        let slabs_mapped = inner.slabs_mapped;

        self.notifier
            .notify_returned_to_os(free_storage.0, free_storage.1);
        self.notifier
            .notify_returned_to_os(quarantine_storage.0, quarantine_storage.1);
        self.notifier
            .notify_returned_to_os(slabs as *const u8, slabs_mapped);
        self.notifier.notify_returned_to_os(self.base, self.heap_size);
        unsafe {
            platform::unmap(slabs as *mut u8, slabs_mapped);
            platform::unmap(self.base, self.heap_size);
        }
        // The queues unmap their own storage on drop.
    }
}
