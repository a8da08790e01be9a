//! Alignment arithmetic for sub-allocating device memory

/// Round `value` up to the next multiple of `alignment`
///
/// Alignments of zero or one leave the value unchanged. The alignment does not
/// need to be a power of two. Returns `None` on overflow.
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

/// Whether `value` is a multiple of `alignment`
pub fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment <= 1 || value % alignment == 0
}
