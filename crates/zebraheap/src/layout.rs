use crate::util::{align_down, is_aligned, PAGE_SIZE, SLAB_SIZE};

/// Size reserved for the block header at the start of the left redzone.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size reserved for the block trailer at the end of the right redzone.
pub const BLOCK_TRAILER_SIZE: usize = 16;

/// The layout of a block inside one slab.
///
/// ```text
/// +--------+----------------+----------+---+----------------+---------+
/// | header | header padding |   body   |gap|    padding     | trailer |
/// +--------+----------------+----------+---+----------------+---------+
/// \--------------- even page --------------/\------- odd page --------/
/// ```
///
/// The body is pushed as far right as its alignment allows, so at most
/// `body_alignment - 1` bytes of gap separate the body end from the odd
/// page. The gap and the trailer-free bytes of the odd page together form
/// the trailer padding. The trailer itself is inside the guard page and
/// therefore inaccessible to normal reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    /// Alignment of the block start.
    pub block_alignment: u32,
    /// Total size of the block, including both redzones.
    pub block_size: u32,
    pub header_size: u32,
    pub header_padding_size: u32,
    pub body_size: u32,
    pub trailer_padding_size: u32,
    pub trailer_size: u32,
}

impl BlockLayout {
    /// Offset of the body from the block start.
    #[inline]
    pub fn body_offset(&self) -> usize {
        (self.header_size + self.header_padding_size) as usize
    }

    /// Header plus header padding.
    #[inline]
    pub fn left_redzone_size(&self) -> usize {
        (self.header_size + self.header_padding_size) as usize
    }

    /// Trailer padding plus trailer.
    #[inline]
    pub fn right_redzone_size(&self) -> usize {
        (self.trailer_padding_size + self.trailer_size) as usize
    }
}

/// Plan the layout of a block whose body ends against the slab's odd page.
///
/// The body start is `align_down(PAGE_SIZE - body_size, body_alignment)`, the
/// rightmost aligned position that keeps the body inside the even page.
/// Returns None when the request cannot be laid out in one slab: a zero or
/// oversized body, redzones that do not fit in a page, or a left region too
/// small for the header and `min_left_rz`.
pub fn plan_block_layout(
    body_size: u32,
    min_left_rz: u32,
    min_right_rz: u32,
    body_alignment: usize,
) -> Option<BlockLayout> {
    debug_assert!(body_alignment.is_power_of_two());
    if body_size == 0 {
        return None;
    }
    // The redzones must fit in a page alongside the body; anything else
    // would produce a non-standard block shape.
    if min_left_rz as usize + body_size as usize > PAGE_SIZE {
        return None;
    }
    if min_right_rz as usize > PAGE_SIZE {
        return None;
    }

    let body_offset = align_down(PAGE_SIZE - body_size as usize, body_alignment);
    if body_offset < BLOCK_HEADER_SIZE || body_offset < min_left_rz as usize {
        return None;
    }
    debug_assert!(is_aligned(body_offset, body_alignment));

    // Gap between the body end and the odd page, always < body_alignment.
    let gap = PAGE_SIZE - body_offset - body_size as usize;
    let trailer_padding = gap + PAGE_SIZE - BLOCK_TRAILER_SIZE;

    let layout = BlockLayout {
        block_alignment: PAGE_SIZE as u32,
        block_size: SLAB_SIZE as u32,
        header_size: BLOCK_HEADER_SIZE as u32,
        header_padding_size: (body_offset - BLOCK_HEADER_SIZE) as u32,
        body_size,
        trailer_padding_size: trailer_padding as u32,
        trailer_size: BLOCK_TRAILER_SIZE as u32,
    };
    debug_assert_eq!(
        layout.header_size
            + layout.header_padding_size
            + layout.body_size
            + layout.trailer_padding_size
            + layout.trailer_size,
        layout.block_size
    );
    debug_assert!(layout.right_redzone_size() >= min_right_rz as usize);
    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::SHADOW_RATIO;

    #[test]
    fn aligned_body_is_flush_with_odd_page() {
        let layout = plan_block_layout(96, 8, 8, SHADOW_RATIO).unwrap();
        assert_eq!(layout.body_offset(), PAGE_SIZE - 96);
        assert_eq!(layout.body_offset() + layout.body_size as usize, PAGE_SIZE);
        assert_eq!(layout.block_size as usize, SLAB_SIZE);
    }

    #[test]
    fn unaligned_body_leaves_sub_ratio_gap() {
        let layout = plan_block_layout(100, 8, 8, SHADOW_RATIO).unwrap();
        assert_eq!(layout.body_offset() % SHADOW_RATIO, 0);
        let gap = PAGE_SIZE - layout.body_offset() - 100;
        assert_eq!(gap, 4);
        // The gap is charged to the trailer padding.
        assert_eq!(
            layout.trailer_padding_size as usize,
            gap + PAGE_SIZE - BLOCK_TRAILER_SIZE
        );
    }

    #[test]
    fn maximum_body_size_boundary() {
        let max = (PAGE_SIZE - BLOCK_HEADER_SIZE) as u32;
        let layout = plan_block_layout(max, 0, 0, SHADOW_RATIO).unwrap();
        assert_eq!(layout.body_offset(), BLOCK_HEADER_SIZE);
        assert_eq!(layout.header_padding_size, 0);
        assert!(plan_block_layout(max + 1, 0, 0, SHADOW_RATIO).is_none());
    }

    #[test]
    fn left_redzone_is_honored() {
        // body_offset for 100 bytes is PAGE_SIZE - 104.
        let offset = (PAGE_SIZE - 104) as u32;
        assert!(plan_block_layout(100, offset, 0, SHADOW_RATIO).is_some());
        assert!(plan_block_layout(100, offset + 1, 0, SHADOW_RATIO).is_none());
    }

    #[test]
    fn oversized_redzones_are_rejected() {
        assert!(plan_block_layout(100, PAGE_SIZE as u32, 0, SHADOW_RATIO).is_none());
        assert!(plan_block_layout(100, 0, PAGE_SIZE as u32, SHADOW_RATIO).is_some());
        assert!(plan_block_layout(100, 0, PAGE_SIZE as u32 + 1, SHADOW_RATIO).is_none());
    }

    #[test]
    fn zero_body_is_rejected() {
        assert!(plan_block_layout(0, 0, 0, SHADOW_RATIO).is_none());
    }

    #[test]
    fn wider_alignment_moves_body_left() {
        let layout = plan_block_layout(100, 0, 0, 16).unwrap();
        assert_eq!(layout.body_offset() % 16, 0);
        assert_eq!(layout.body_offset(), PAGE_SIZE - 112);
    }

    #[test]
    fn parts_always_sum_to_block_size() {
        for size in [1u32, 7, 8, 100, 1024, 4000, 4080] {
            let layout = plan_block_layout(size, 8, 8, SHADOW_RATIO).unwrap();
            assert_eq!(
                layout.header_size
                    + layout.header_padding_size
                    + layout.body_size
                    + layout.trailer_padding_size
                    + layout.trailer_size,
                layout.block_size,
                "size {}",
                size
            );
        }
    }
}
