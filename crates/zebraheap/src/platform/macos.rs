use core::ptr;

/// Map `size` bytes of zero-filled read-write memory, page-aligned.
/// Returns null when the kernel refuses the mapping.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let mapping = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if mapping == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        mapping as *mut u8
    }
}

/// Hand a mapping back to the kernel.
///
/// # Safety
/// `ptr` and `size` must describe a mapping obtained from `map_anonymous`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Revoke all access to a page range, turning it into a guard region.
///
/// # Safety
/// The range must lie inside a live mapping and be page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE) == 0
}

/// Restore read-write access to a range revoked with `protect_none`.
///
/// # Safety
/// The range must lie inside a live mapping and be page-aligned.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Tell the kernel a range's contents are disposable. Darwin's madvise
/// makes no zero-fill promise, so the range is instead remapped in place
/// with MAP_FIXED, which atomically installs fresh anonymous pages.
///
/// # Safety
/// The range must lie inside a live mapping and be page-aligned.
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    let remapped = libc::mmap(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    debug_assert!(remapped != libc::MAP_FAILED, "in-place remap failed");
}

/// Stable id of the calling thread. Never zero for a live thread.
/// Uncached; callers that care (the lock) keep their own TLS copy.
pub fn current_thread_id() -> usize {
    let mut tid: u64 = 0;
    unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
    tid as usize
}
