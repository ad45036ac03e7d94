use crate::util::DEFAULT_HEAP_SIZE;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Cached config values (read once, never allocate).
static HEAP_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_HEAP_SIZE);
static QUARANTINE_PERCENT: AtomicUsize = AtomicUsize::new(25);

/// Read configuration from environment variables.
/// Must be called before the heap is constructed.
///
/// # Safety
/// Calls libc::getenv, which is not thread-safe against concurrent
/// modification of the environment; call from a single-threaded context.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"ZEBRAHEAP_HEAP_SIZE\0") {
        HEAP_SIZE.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"ZEBRAHEAP_QUARANTINE_PERCENT\0") {
        QUARANTINE_PERCENT.store(val.min(100), Ordering::Relaxed);
    }
}

/// Configured reservation size in bytes.
pub fn heap_size() -> usize {
    HEAP_SIZE.load(Ordering::Relaxed)
}

/// Configured quarantine ratio in [0, 1].
pub fn quarantine_ratio() -> f32 {
    QUARANTINE_PERCENT.load(Ordering::Relaxed) as f32 / 100.0
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None; // Invalid
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
