//! Arena providers: the memory the allocator carves blocks out of.
//!
//! The allocator only ever asks for more memory at the high end of its
//! arena. A provider hands out one contiguous region that grows upwards and
//! never shrinks.

use core::ptr::NonNull;
use std::alloc::{self, Layout};

use libc::{c_void, intptr_t, sbrk};
use snafu::{OptionExt as _, Snafu, ensure};

use crate::align::ALIGNMENT;

/// Errors reported by an [`ArenaProvider`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArenaError {
  #[snafu(display("arena exhausted: requested {requested} bytes, {available} available"))]
  Exhausted { requested: usize, available: usize },
  #[snafu(display("sbrk could not extend the program break by {requested} bytes"))]
  Sbrk { requested: usize },
  #[snafu(display("could not reserve a {capacity}-byte arena"))]
  Reserve { capacity: usize },
  #[snafu(display("arena is no longer contiguous: expected {expected:#x}, got {actual:#x}"))]
  Discontiguous { expected: usize, actual: usize },
}

/// Supplier of the contiguous, growable region managed by the allocator.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - [`grow`](ArenaProvider::grow) returns the previous
///   [`upper_bound`](ArenaProvider::upper_bound), so the arena stays one
///   contiguous region,
/// - every byte in `lower_bound()..upper_bound()` stays valid for reads and
///   writes and is used by nobody else for the provider's lifetime,
/// - `lower_bound()` is a multiple of [`ALIGNMENT`].
pub unsafe trait ArenaProvider {
  /// Extends the arena by `delta` bytes and returns where the new bytes
  /// begin.
  fn grow(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, ArenaError>;

  /// First byte of the arena.
  fn lower_bound(&self) -> NonNull<u8>;

  /// One past the last byte of the arena.
  fn upper_bound(&self) -> NonNull<u8>;

  /// Current arena length in bytes.
  fn len(&self) -> usize {
    self.upper_bound().as_ptr().addr() - self.lower_bound().as_ptr().addr()
  }

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A fixed-capacity region reserved up front and handed out monotonically.
///
/// Simulates a program break without touching the process's real one, so
/// several arenas can live side by side.
pub struct FixedArena {
  base: NonNull<u8>,
  len: usize,
  capacity: usize,
}

impl FixedArena {
  /// Reserves `capacity` zeroed bytes aligned to [`ALIGNMENT`].
  pub fn with_capacity(capacity: usize) -> Result<Self, ArenaError> {
    let layout = Self::layout(capacity).context(ReserveSnafu { capacity })?;
    let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).context(ReserveSnafu { capacity })?;

    log::debug!("reserved fixed arena of {capacity} bytes at {base:p}");

    Ok(Self {
      base,
      len: 0,
      capacity,
    })
  }

  fn layout(capacity: usize) -> Option<Layout> {
    Layout::from_size_align(capacity.max(1), ALIGNMENT).ok()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes that can still be handed out.
  pub fn remaining(&self) -> usize {
    self.capacity - self.len
  }
}

unsafe impl ArenaProvider for FixedArena {
  fn grow(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, ArenaError> {
    let available = self.remaining();
    ensure!(delta <= available, ExhaustedSnafu { requested: delta, available });

    let start = unsafe { self.base.add(self.len) };
    self.len += delta;
    Ok(start)
  }

  fn lower_bound(&self) -> NonNull<u8> {
    self.base
  }

  fn upper_bound(&self) -> NonNull<u8> {
    unsafe { self.base.add(self.len) }
  }
}

impl Drop for FixedArena {
  fn drop(&mut self) {
    if let Some(layout) = Self::layout(self.capacity) {
      unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
    }
  }
}

/// The process data segment, grown with `sbrk(2)`.
///
/// Only one `SbrkArena` should exist per process, and nothing else may move
/// the program break while it is alive. A move is detected on the next
/// [`grow`](ArenaProvider::grow), which then fails with
/// [`ArenaError::Discontiguous`] and leaves the arena as it was.
pub struct SbrkArena {
  lower: NonNull<u8>,
  upper: NonNull<u8>,
}

impl SbrkArena {
  /// Starts an arena at the current program break, padded up to
  /// [`ALIGNMENT`].
  pub fn new() -> Result<Self, ArenaError> {
    let brk = Self::sbrk(0)?;
    let pad = brk.align_offset(ALIGNMENT);
    if pad > 0 {
      Self::sbrk(pad)?;
    }

    let lower = unsafe { brk.add(pad) };
    log::debug!("sbrk arena starts at {lower:p} ({pad} bytes of padding)");

    Ok(Self { lower, upper: lower })
  }

  fn sbrk(delta: usize) -> Result<NonNull<u8>, ArenaError> {
    let increment = intptr_t::try_from(delta).ok().context(SbrkSnafu { requested: delta })?;
    let address = unsafe { sbrk(increment) };

    ensure!(address != usize::MAX as *mut c_void, SbrkSnafu { requested: delta });
    NonNull::new(address.cast::<u8>()).context(SbrkSnafu { requested: delta })
  }
}

unsafe impl ArenaProvider for SbrkArena {
  fn grow(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, ArenaError> {
    let start = Self::sbrk(delta)?;
    ensure!(
      start == self.upper,
      DiscontiguousSnafu {
        expected: self.upper.as_ptr().addr(),
        actual: start.as_ptr().addr(),
      }
    );

    self.upper = unsafe { start.add(delta) };
    Ok(start)
  }

  fn lower_bound(&self) -> NonNull<u8> {
    self.lower
  }

  fn upper_bound(&self) -> NonNull<u8> {
    self.upper
  }
}
