#![no_main]

use libfuzzer_sys::fuzz_target;
use zebraheap::util::SLAB_SIZE;
use zebraheap::{CompactBlockInfo, NullMemoryNotifier, PushResult, ZebraBlockHeap};

/// Fuzz target that interprets a byte slice as a sequence of heap operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=allocate_block, 2=free, 3=push+trim,
///           4=pop, 5=empty, 6=set_ratio)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked descriptor to operate on)
///
/// We track up to 16 live descriptors and after every operation check that
/// the free, allocated and quarantined slabs still partition the heap.
const MAX_SLOTS: usize = 16;
const HEAP_SLABS: usize = 8;

static NOTIFIER: NullMemoryNotifier = NullMemoryNotifier;

fn check_partition(heap: &ZebraBlockHeap) {
    assert_eq!(
        heap.free_count() + heap.allocated_count() + heap.quarantined_count(),
        HEAP_SLABS,
        "slab states no longer partition the heap"
    );
}

fuzz_target!(|data: &[u8]| {
    let heap = match ZebraBlockHeap::new(HEAP_SLABS * SLAB_SIZE, &NOTIFIER) {
        Some(h) => h,
        None => return,
    };
    let mut slots: [Option<CompactBlockInfo>; MAX_SLOTS] = [None; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 7;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as u32;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // Raw allocate; drop any descriptor already in the slot.
                if let Some(old) = slots[slot].take() {
                    assert!(heap.free(old.header));
                }
                if let Some(ptr) = heap.allocate(size) {
                    slots[slot] = Some(CompactBlockInfo {
                        header: ptr,
                        body: ptr,
                        body_size: size,
                        block_size: size,
                    });
                }
            }
            1 => {
                if let Some(old) = slots[slot].take() {
                    assert!(heap.free(old.header));
                }
                let min_left = (size % 64) as u32;
                let min_right = (size % 128) as u32;
                if let Ok(alloc) = heap.allocate_block(size, min_left, min_right) {
                    slots[slot] = Some(alloc.info());
                }
            }
            2 => {
                if let Some(info) = slots[slot].take() {
                    assert!(heap.free_block(&info), "free of a live block failed");
                }
            }
            3 => {
                // Push followed by the synchronous trim.
                if let Some(info) = slots[slot].take() {
                    assert_eq!(heap.push(&info), PushResult::SyncTrimRequired);
                    heap.pop();
                }
            }
            4 => {
                heap.pop();
            }
            5 => {
                heap.empty();
            }
            6 => {
                heap.set_quarantine_ratio((size % 101) as f32 / 100.0);
            }
            _ => unreachable!(),
        }

        check_partition(&heap);
    }

    // Cleanup: drain the quarantine and free every tracked descriptor.
    heap.empty();
    for slot in slots.iter_mut() {
        if let Some(info) = slot.take() {
            assert!(heap.free_block(&info));
        }
    }
    assert_eq!(heap.free_count(), HEAP_SLABS);
});
