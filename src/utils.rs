#[must_use]
pub const fn is_pow2(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

/// Rounds `val` up to a multiple of `align`, which must be a power of two.
/// Returns `None` if the result does not fit in a `u64`.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}
