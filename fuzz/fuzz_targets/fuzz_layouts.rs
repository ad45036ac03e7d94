#![no_main]

use libfuzzer_sys::fuzz_target;
use zebraheap::layout::{plan_block_layout, BLOCK_HEADER_SIZE};
use zebraheap::util::{PAGE_SIZE, SLAB_SIZE};

// Fuzz target that exercises the placement arithmetic.
// Interprets input as (size, min_left, min_right, alignment_shift) tuples
// and checks every planned layout against the placement invariants: the
// body is aligned, ends within one alignment step of the odd page, and the
// redzones cover what was asked for.

fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 7 <= data.len() {
        let size = u16::from_le_bytes([data[i], data[i + 1]]) as u32;
        let min_left = u16::from_le_bytes([data[i + 2], data[i + 3]]) as u32;
        let min_right = u16::from_le_bytes([data[i + 4], data[i + 5]]) as u32;
        // Alignments from 8 (the shadow ratio) up to 4096.
        let align = 8usize << (data[i + 6] % 10);
        i += 7;

        let layout = match plan_block_layout(size, min_left, min_right, align) {
            Some(l) => l,
            None => continue,
        };

        // Parts tile the block exactly.
        assert_eq!(
            layout.header_size
                + layout.header_padding_size
                + layout.body_size
                + layout.trailer_padding_size
                + layout.trailer_size,
            layout.block_size
        );
        assert_eq!(layout.block_size as usize, SLAB_SIZE);
        assert_eq!(layout.body_size, size);

        // The body is aligned and pushed against the odd page: the residual
        // gap is smaller than one alignment step.
        let body_offset = layout.body_offset();
        assert_eq!(body_offset % align, 0);
        let body_end = body_offset + size as usize;
        assert!(body_end <= PAGE_SIZE);
        assert!(PAGE_SIZE - body_end < align);

        // Redzones hold what was requested.
        assert!(layout.left_redzone_size() >= BLOCK_HEADER_SIZE);
        assert!(layout.left_redzone_size() >= min_left as usize);
        assert!(layout.right_redzone_size() >= min_right as usize);
    }
});
