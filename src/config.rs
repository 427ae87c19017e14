//! Tunable allocator behavior.
//!
//! The block layout itself is fixed (see [`crate::block`]); only policy lives
//! here.

use crate::block::MIN_BLOCK_SIZE;

/// What to do with the tail left over when a block is split and the tail is
/// too small to be linked into the free-block tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
  /// Leave the tail as a free but untracked fragment. It is only recovered
  /// once a neighbor is freed and coalesces with it.
  #[default]
  Abandon,
  /// Keep the tail inside the allocated block, so a split never creates an
  /// untracked fragment.
  Absorb,
}

impl SplitPolicy {
  /// Tails below this size are handled by the policy; larger tails always
  /// become tracked free blocks.
  pub const REMAINDER_THRESHOLD: usize = MIN_BLOCK_SIZE;
}

/// Allocator configuration.
///
/// ```rust
/// use rbtalloc::{Config, SplitPolicy};
///
/// let config = Config::new()
///   .with_split_policy(SplitPolicy::Absorb)
///   .with_stop_on_first_violation(true);
/// assert_eq!(config.split_policy, SplitPolicy::Absorb);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub split_policy: SplitPolicy,
  /// Makes the consistency checker return at the first violation instead of
  /// collecting all of them.
  pub stop_on_first_violation: bool,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      split_policy: SplitPolicy::Abandon,
      stop_on_first_violation: false,
    }
  }

  #[must_use]
  pub const fn with_split_policy(
    mut self,
    split_policy: SplitPolicy,
  ) -> Self {
    self.split_policy = split_policy;
    self
  }

  #[must_use]
  pub const fn with_stop_on_first_violation(
    mut self,
    stop: bool,
  ) -> Self {
    self.stop_on_first_violation = stop;
    self
  }
}
