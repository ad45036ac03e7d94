use crate::layout::BlockLayout;
use core::ptr;

/// Compact descriptor of a served allocation: header start, body start, body
/// size and total block size. The heap keeps exactly one of these per
/// non-free slab and hands out copies; callers pass them back to free, push
/// and pop.
///
/// For raw allocations header == body and block_size == body_size. For block
/// allocations the header is the slab start and block_size covers both pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactBlockInfo {
    pub header: *mut u8,
    pub body: *mut u8,
    pub body_size: u32,
    pub block_size: u32,
}

impl CompactBlockInfo {
    pub const fn empty() -> Self {
        CompactBlockInfo {
            header: ptr::null_mut(),
            body: ptr::null_mut(),
            body_size: 0,
            block_size: 0,
        }
    }
}

/// Outcome of a quarantine push.
///
/// This heap trims synchronously: every accepted push asks the caller to
/// invoke `pop` before finishing the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
    /// The slab is quarantined; call `pop` now to re-establish the ratio
    /// bound.
    SyncTrimRequired,
    /// The descriptor did not identify an allocated slab; nothing changed.
    Rejected,
}

impl PushResult {
    #[inline]
    pub fn accepted(self) -> bool {
        self == PushResult::SyncTrimRequired
    }
}

/// Pop-result tag used by multi-policy quarantines to rank evictions by
/// heat. This heap trims by size only and always reports Green.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrimColor {
    Green,
    /// Never produced by this heap; present so callers can share trim
    /// handling with temperature-driven quarantines.
    Red,
}

/// A successful quarantine eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PopResult {
    pub info: CompactBlockInfo,
    pub color: TrimColor,
}

/// Why a block allocation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAllocError {
    /// No free slab; every slab is allocated or quarantined.
    OutOfCapacity,
    /// The body and redzones cannot be laid out in one slab.
    TooLarge,
}

/// A successful block allocation: the block start (== slab start), the body
/// pointer inside it, and the planned layout.
#[derive(Clone, Copy, Debug)]
pub struct BlockAllocation {
    pub block: *mut u8,
    pub body: *mut u8,
    pub layout: BlockLayout,
}

impl BlockAllocation {
    /// The descriptor the heap recorded for this allocation; pass it to
    /// `free_block` or `push`.
    pub fn info(&self) -> CompactBlockInfo {
        CompactBlockInfo {
            header: self.block,
            body: self.body,
            body_size: self.layout.body_size,
            block_size: self.layout.block_size,
        }
    }
}
