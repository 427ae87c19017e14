use snafu::Snafu;

use crate::arena::ArenaError;

/// Errors returned by [`TreeAllocator`](crate::TreeAllocator).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
  #[snafu(display("could not obtain the initial arena"))]
  InitArena { source: ArenaError },
  #[snafu(display("out of memory serving a {request}-byte request"))]
  OutOfMemory { request: usize, source: ArenaError },
  #[snafu(display("a {request}-byte request does not fit in a block"))]
  RequestTooLarge { request: usize },
  #[snafu(display("double free of block at {addr:#x}"))]
  DoubleFree { addr: usize },
}

impl Error {
  /// `true` for failures that leave the allocator usable: the caller may
  /// free memory and retry.
  pub fn is_out_of_memory(&self) -> bool {
    matches!(self, Self::OutOfMemory { .. } | Self::RequestTooLarge { .. })
  }
}
