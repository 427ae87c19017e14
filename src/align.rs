/// Granularity every block size and every returned address is a multiple of.
pub const ALIGNMENT: usize = 16;

/// Rounds the given byte count up to the next multiple of [`ALIGNMENT`].
///
/// # Examples
///
/// ```rust
/// use rbtalloc::align;
///
/// assert_eq!(align!(1), 16);
/// assert_eq!(align!(16), 16);
/// assert_eq!(align!(40 + 16), 64);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    ($value + $crate::align::ALIGNMENT - 1) & !($crate::align::ALIGNMENT - 1)
  };
}

/// Same as [`align!`], but returns `None` instead of wrapping around when the
/// rounded value does not fit in a `usize`.
pub const fn checked_align(value: usize) -> Option<usize> {
  match value.checked_add(ALIGNMENT - 1) {
    Some(padded) => Some(padded & !(ALIGNMENT - 1)),
    None => None,
  }
}

/// Returns `true` if `value` is a multiple of [`ALIGNMENT`].
pub const fn is_aligned(value: usize) -> bool {
  value & (ALIGNMENT - 1) == 0
}
