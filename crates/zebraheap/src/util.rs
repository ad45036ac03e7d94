/// Round `value` up to the nearest multiple of `align`, which must be a
/// power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to the nearest multiple of `align`, which must be a
/// power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Whether `value` is a multiple of `align`, which must be a power of two.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Page size (4 KiB on all supported platforms).
pub const PAGE_SIZE: usize = 4096;

/// A slab is an even (writable) page followed by an odd (guard) page.
pub const SLAB_SIZE: usize = 2 * PAGE_SIZE;

/// Alignment every block body must satisfy so shadow memory can describe it.
pub const SHADOW_RATIO: usize = 8;

/// The largest raw allocation the heap serves. Anything bigger than a page
/// cannot end inside a single even page.
pub const MAX_RAW_ALLOCATION_SIZE: usize = PAGE_SIZE;

/// The largest block body that can be allocated. The block header must still
/// fit to the left of the body inside the even page.
pub const MAX_BLOCK_ALLOCATION_SIZE: usize = PAGE_SIZE - crate::layout::BLOCK_HEADER_SIZE;

/// Default reservation when none is configured.
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Default fraction of the reservation the quarantine may hold.
pub const DEFAULT_QUARANTINE_RATIO: f32 = 0.25;

/// Abort with a diagnostic message to stderr.
/// Used when the heap cannot be left in a coherent state (e.g. a guard page
/// that cannot be protected).
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}
