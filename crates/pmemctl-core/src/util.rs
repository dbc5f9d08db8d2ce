//! Page-granularity constants and alignment helpers.

/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Rounds `value` down to the previous multiple of `align`.
///
/// `align` must be a power of two.
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to the next multiple of `align`.
///
/// `align` must be a power of two. Saturates at `u64::MAX & !(align - 1)`
/// instead of wrapping.
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}
