//! The allocator engine: allocate, deallocate and resize on top of the block
//! codec and the free-block tree.

use core::{
  marker::PhantomData,
  ptr::{self, NonNull},
};

use snafu::{OptionExt as _, ResultExt as _};

use crate::{
  align::checked_align,
  arena::ArenaProvider,
  block::{Block, EPILOGUE_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, Tag},
  config::{Config, SplitPolicy},
  error::{DoubleFreeSnafu, Error, InitArenaSnafu, OutOfMemorySnafu, RequestTooLargeSnafu},
  tree::FreeTree,
};

/// Best-fit allocator over a single growable arena.
///
/// ```text
///   lower_bound                                                upper_bound
///   ┌────────────┬─────────┬──────────────┬─────────┬───────┬───┐
///   │  prologue  │  used   │     free     │  used   │ free  │ E │
///   │ (sentinel) │         │ (tree node)  │         │ (<48) │   │
///   └────────────┴─────────┴──────────────┴─────────┴───────┴───┘
///                                                             ▲
///                                   epilogue: boundary word of ┘
///                                   the topmost block
/// ```
///
/// The prologue is a permanently allocated block that doubles as the tree
/// sentinel. The epilogue is a single boundary word at the very end; each
/// growth turns it into the header of the new block and writes a fresh one.
pub struct TreeAllocator<A> {
  arena: A,
  tree: FreeTree,
  config: Config,
}

impl<A: ArenaProvider> TreeAllocator<A> {
  /// Initializes an allocator with the default [`Config`].
  pub fn new(arena: A) -> Result<Self, Error> {
    Self::init(arena, Config::default())
  }

  /// Lays the prologue and the epilogue down at the start of `arena` and
  /// returns an allocator with an empty free-block tree.
  pub fn init(
    mut arena: A,
    config: Config,
  ) -> Result<Self, Error> {
    let start = arena.grow(MIN_BLOCK_SIZE + EPILOGUE_SIZE).context(InitArenaSnafu)?;
    debug_assert!(crate::align::is_aligned(start.as_ptr().addr()));

    let prologue = Block::at(start);
    let tree = unsafe {
      prologue.set_prev_tag(Tag::new(0, false));
      prologue.set_boundary(Tag::new(MIN_BLOCK_SIZE, false));
      FreeTree::new(prologue)
    };

    log::debug!("allocator initialized, prologue at {start:p}");

    Ok(Self { arena, tree, config })
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub(crate) fn tree(&self) -> &FreeTree {
    &self.tree
  }

  /// The lone boundary word at the end of the arena.
  pub(crate) fn epilogue(&self) -> Block {
    let upper = self.arena.upper_bound();
    Block::at(unsafe { upper.sub(EPILOGUE_SIZE) })
  }

  /// The first block after the prologue. Equals the epilogue while the
  /// arena holds no blocks.
  pub(crate) fn first_block(&self) -> Block {
    unsafe { self.tree.sentinel().offset(MIN_BLOCK_SIZE) }
  }

  /// Block size serving a `request`-byte allocation: header included,
  /// rounded to the alignment, never below [`MIN_BLOCK_SIZE`].
  fn block_size_for(request: usize) -> Result<usize, Error> {
    let size = request
      .checked_add(HEADER_SIZE)
      .and_then(checked_align)
      .filter(|&size| isize::try_from(size).is_ok())
      .context(RequestTooLargeSnafu { request })?;
    Ok(size.max(MIN_BLOCK_SIZE))
  }

  /// Extends the arena by `delta` bytes. The epilogue moves up; nothing is
  /// written.
  fn extend(
    &mut self,
    delta: usize,
    request: usize,
  ) -> Result<(), Error> {
    let start = self
      .arena
      .grow(delta)
      .context(OutOfMemorySnafu { request })
      .inspect_err(|err| log::warn!("{err}"))?;

    log::debug!(
      "arena grew by {delta} bytes at {start:p}, upper bound now {:p}",
      self.arena.upper_bound()
    );
    Ok(())
  }

  /// Marks `block` free, updates the boundary copy and links it into the
  /// tree when it is large enough.
  unsafe fn release(
    &mut self,
    block: Block,
    size: usize,
  ) {
    unsafe {
      block.set_boundary(Tag::new(size, true));
      if size >= MIN_BLOCK_SIZE {
        self.tree.insert(block);
      }
    }
  }

  /// Splits the `total` bytes starting at `block` so that a prefix of at
  /// least `wanted` bytes is kept for the caller, and releases the tail.
  /// Returns the size of the kept prefix, which the caller marks allocated.
  ///
  /// `block` itself is neither in the tree nor re-tagged here.
  unsafe fn carve(
    &mut self,
    block: Block,
    total: usize,
    wanted: usize,
  ) -> usize {
    debug_assert!(wanted <= total);

    let remainder = total - wanted;
    if remainder == 0 {
      return total;
    }
    if remainder < SplitPolicy::REMAINDER_THRESHOLD && self.config.split_policy == SplitPolicy::Absorb {
      return total;
    }

    unsafe { self.release(block.offset(wanted), remainder) };
    wanted
  }

  /// Allocates at least `size` bytes.
  ///
  /// The returned region is aligned to [`ALIGNMENT`](crate::align::ALIGNMENT).
  /// Fails when the arena cannot grow; the allocator stays usable.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, Error> {
    let block_size = Self::block_size_for(size)?;

    let (block, kept) = match unsafe { self.tree.find_best_fit(block_size) } {
      Some(block) => unsafe {
        self.tree.delete(block);
        let kept = self.carve(block, block.size(), block_size);
        (block, kept)
      },
      None => (self.grow_for(block_size, size)?, block_size),
    };

    unsafe {
      block.set_boundary(Tag::new(kept, false));
      let user = block.user_ptr();
      log::trace!("allocate({size}) -> {user:p} (block of {kept} bytes)");
      Ok(user)
    }
  }

  /// Makes room for a `block_size` block at the top of the arena, reusing
  /// the topmost block when it is free. The returned block is unlinked and
  /// not yet tagged.
  fn grow_for(
    &mut self,
    block_size: usize,
    request: usize,
  ) -> Result<Block, Error> {
    let epilogue = self.epilogue();
    let top_tag = unsafe { epilogue.prev_tag() };

    if !top_tag.is_free() {
      self.extend(block_size, request)?;
      return Ok(epilogue);
    }

    // the arena grows before the tree changes, so a failed growth leaves the
    // topmost block linked
    let top = unsafe { epilogue.prev() };
    self.extend(block_size - top_tag.size(), request)?;
    if top_tag.size() >= MIN_BLOCK_SIZE {
      unsafe { self.tree.delete(top) };
    }
    Ok(top)
  }

  /// Returns the block behind `ptr` to the allocator, coalescing it with
  /// free neighbors.
  ///
  /// Freeing a block that is already free is reported as
  /// [`Error::DoubleFree`] and changes nothing.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by [`allocate`](Self::allocate) or
  /// [`resize`](Self::resize) on this allocator. Passing it again after it
  /// was freed is only detected when the first call left its header in
  /// place: if that call merged the block into a free predecessor, or the
  /// memory was handed out again since, the header is stale and a second
  /// call corrupts the heap.
  pub unsafe fn deallocate(
    &mut self,
    ptr: NonNull<u8>,
  ) -> Result<(), Error> {
    unsafe {
      let block = Block::from_user(ptr);
      let tag = block.tag();

      if tag.is_free() {
        log::warn!("double free of {ptr:p} ignored");
        return DoubleFreeSnafu { addr: block.addr() }.fail();
      }

      let mut start = block;
      let mut size = tag.size();

      let prev_tag = block.prev_tag();
      if prev_tag.is_free() {
        let prev = block.prev();
        if prev_tag.size() >= MIN_BLOCK_SIZE {
          self.tree.delete(prev);
        }
        start = prev;
        size += prev_tag.size();
      }

      let next = block.next();
      if next != self.epilogue() && next.is_free() {
        if next.is_tracked() {
          self.tree.delete(next);
        }
        size += next.size();
      }

      self.release(start, size);
      log::trace!("deallocate({ptr:p}) -> free block {start:?} of {size} bytes");
    }
    Ok(())
  }

  /// Resizes the allocation behind `ptr` to `new_size` bytes.
  ///
  /// - `None` behaves like [`allocate`](Self::allocate).
  /// - `new_size == 0` behaves like [`deallocate`](Self::deallocate) and
  ///   returns `Ok(None)`.
  /// - Otherwise the block is shrunk or grown in place whenever possible;
  ///   only as a last resort is the data moved to a new block, copying the
  ///   smaller of the old and new sizes.
  ///
  /// On failure the original allocation is left untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be `None` or a live allocation of this allocator.
  pub unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    new_size: usize,
  ) -> Result<Option<NonNull<u8>>, Error> {
    let Some(ptr) = ptr else {
      return self.allocate(new_size).map(Some);
    };

    if new_size == 0 {
      unsafe { self.deallocate(ptr)? };
      return Ok(None);
    }

    let wanted = Self::block_size_for(new_size)?;
    let block = unsafe { Block::from_user(ptr) };
    let size = unsafe { block.size() };
    let next = unsafe { block.next() };
    let epilogue = self.epilogue();

    if next == epilogue {
      if unsafe { self.resize_topmost(block, size, wanted, new_size) } {
        return Ok(Some(ptr));
      }
    } else if wanted <= size {
      unsafe { self.shrink(block, size, next, wanted) };
      log::trace!("resize({ptr:p}, {new_size}) -> shrunk in place");
      return Ok(Some(ptr));
    } else if unsafe { self.grow_into_next(block, size, next, wanted, new_size)? } {
      log::trace!("resize({ptr:p}, {new_size}) -> grew into next block");
      return Ok(Some(ptr));
    }

    let moved = unsafe { self.relocate(ptr, size, new_size)? };
    log::trace!("resize({ptr:p}, {new_size}) -> moved to {moved:p}");
    Ok(Some(moved))
  }

  /// The block ends at the epilogue: shrink by splitting, grow by extending
  /// the arena under it. Returns `false` when the arena cannot grow and
  /// nothing was changed.
  unsafe fn resize_topmost(
    &mut self,
    block: Block,
    size: usize,
    wanted: usize,
    request: usize,
  ) -> bool {
    let kept = if wanted <= size {
      unsafe { self.carve(block, size, wanted) }
    } else if self.extend(wanted - size, request).is_ok() {
      wanted
    } else {
      return false;
    };

    unsafe { block.set_boundary(Tag::new(kept, false)) };
    log::trace!("resize of topmost {block:?}: {size} -> {kept} bytes in place");
    true
  }

  /// Splits the tail off `block`, folding a free `next` block into it.
  unsafe fn shrink(
    &mut self,
    block: Block,
    size: usize,
    next: Block,
    wanted: usize,
  ) {
    if wanted == size {
      return;
    }

    unsafe {
      let mut total = size;
      if next.is_free() {
        if next.is_tracked() {
          self.tree.delete(next);
        }
        total += next.size();
      }

      let kept = self.carve(block, total, wanted);
      block.set_boundary(Tag::new(kept, false));
    }
  }

  /// Grows `block` over its free successor. Returns `false` when that is not
  /// possible and nothing was changed.
  unsafe fn grow_into_next(
    &mut self,
    block: Block,
    size: usize,
    next: Block,
    wanted: usize,
    request: usize,
  ) -> Result<bool, Error> {
    unsafe {
      let next_tag = next.tag();
      if !next_tag.is_free() {
        return Ok(false);
      }

      let total = size + next_tag.size();
      let kept = if total >= wanted {
        if next_tag.size() >= MIN_BLOCK_SIZE {
          self.tree.delete(next);
        }
        self.carve(block, total, wanted)
      } else if next.next() == self.epilogue() {
        // the free successor is the topmost block: top up the arena, or let
        // the caller look for a block elsewhere
        if self.extend(wanted - total, request).is_err() {
          return Ok(false);
        }
        if next_tag.size() >= MIN_BLOCK_SIZE {
          self.tree.delete(next);
        }
        wanted
      } else {
        return Ok(false);
      };

      block.set_boundary(Tag::new(kept, false));
      Ok(true)
    }
  }

  /// Last resort: allocate elsewhere, copy, free the old block.
  unsafe fn relocate(
    &mut self,
    ptr: NonNull<u8>,
    size: usize,
    new_size: usize,
  ) -> Result<NonNull<u8>, Error> {
    let moved = self.allocate(new_size)?;
    let count = (size - HEADER_SIZE).min(new_size);

    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), count);
      self.deallocate(ptr)?;
    }
    Ok(moved)
  }

  /// Bytes the caller may use behind `ptr`; at least the size it asked for.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this allocator.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    unsafe { Block::from_user(ptr).size() - HEADER_SIZE }
  }

  /// Every block between the prologue and the epilogue, in address order.
  pub fn blocks(&self) -> Blocks<'_, A> {
    Blocks {
      cursor: self.first_block(),
      end: self.epilogue(),
      _heap: PhantomData,
    }
  }

  /// Walks the arena and tallies its blocks.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      arena_bytes: self.arena.len(),
      ..HeapStats::default()
    };

    for info in self.blocks() {
      match (info.free, info.size >= MIN_BLOCK_SIZE) {
        (false, _) => {
          stats.allocated_blocks += 1;
          stats.allocated_bytes += info.size;
        }
        (true, true) => {
          stats.tracked_blocks += 1;
          stats.tracked_bytes += info.size;
        }
        (true, false) => {
          stats.fragment_blocks += 1;
          stats.fragment_bytes += info.size;
        }
      }
    }

    stats
  }
}

/// One block as seen by [`TreeAllocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Start of the block header.
  pub addr: usize,
  /// Total size, header included.
  pub size: usize,
  pub free: bool,
}

impl BlockInfo {
  /// Free and large enough to be in the free-block tree.
  pub fn is_tracked(&self) -> bool {
    self.free && self.size >= MIN_BLOCK_SIZE
  }
}

/// Iterator over the blocks of an arena.
///
/// Stops early if a header claims a size that would step past the epilogue.
pub struct Blocks<'a, A> {
  cursor: Block,
  end: Block,
  _heap: PhantomData<&'a TreeAllocator<A>>,
}

impl<A> Iterator for Blocks<'_, A> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    if self.cursor >= self.end {
      return None;
    }

    let tag = unsafe { self.cursor.tag() };
    let info = BlockInfo {
      addr: self.cursor.addr(),
      size: tag.size(),
      free: tag.is_free(),
    };

    if tag.size() == 0 || tag.size() > self.end.addr() - self.cursor.addr() {
      self.cursor = self.end;
    } else {
      self.cursor = unsafe { self.cursor.offset(tag.size()) };
    }
    Some(info)
  }
}

/// Block tallies returned by [`TreeAllocator::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
  pub arena_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  /// Free blocks linked into the tree.
  pub tracked_blocks: usize,
  pub tracked_bytes: usize,
  /// Free blocks too small for the tree.
  pub fragment_blocks: usize,
  pub fragment_bytes: usize,
}

impl HeapStats {
  pub fn free_bytes(&self) -> usize {
    self.tracked_bytes + self.fragment_bytes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{align::ALIGNMENT, arena::FixedArena};

  const PROLOGUE_BYTES: usize = MIN_BLOCK_SIZE + EPILOGUE_SIZE;

  fn heap(capacity: usize) -> TreeAllocator<FixedArena> {
    TreeAllocator::new(FixedArena::with_capacity(capacity).unwrap()).unwrap()
  }

  fn absorbing_heap(capacity: usize) -> TreeAllocator<FixedArena> {
    let config = Config::new().with_split_policy(SplitPolicy::Absorb);
    TreeAllocator::init(FixedArena::with_capacity(capacity).unwrap(), config).unwrap()
  }

  fn assert_consistent(heap: &TreeAllocator<FixedArena>) {
    let report = heap.check(false);
    assert!(report.is_consistent(), "{report}");
  }

  fn block_of(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr().addr() - HEADER_SIZE
  }

  fn fill(
    ptr: NonNull<u8>,
    len: usize,
    seed: u8,
  ) {
    for i in 0..len {
      unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
    }
  }

  fn holds(
    ptr: NonNull<u8>,
    len: usize,
    seed: u8,
  ) -> bool {
    (0..len).all(|i| unsafe { ptr.add(i).read() } == seed.wrapping_add(i as u8))
  }

  #[test]
  fn test_init_lays_out_prologue_and_epilogue() {
    let heap = heap(1024);
    assert_eq!(heap.arena().len(), PROLOGUE_BYTES);
    assert_eq!(heap.first_block(), heap.epilogue());
    assert_eq!(heap.blocks().count(), 0);
    assert_eq!(heap.stats(), HeapStats {
      arena_bytes: PROLOGUE_BYTES,
      ..HeapStats::default()
    });
    assert_consistent(&heap);
  }

  #[test]
  fn test_init_fails_without_room_for_prologue() {
    let err = TreeAllocator::new(FixedArena::with_capacity(PROLOGUE_BYTES - 1).unwrap())
      .err()
      .unwrap();
    assert!(matches!(err, Error::InitArena { .. }));
  }

  #[test]
  fn test_block_size_for() {
    type Heap = TreeAllocator<FixedArena>;
    assert_eq!(Heap::block_size_for(0).unwrap(), MIN_BLOCK_SIZE);
    assert_eq!(Heap::block_size_for(1).unwrap(), MIN_BLOCK_SIZE);
    assert_eq!(Heap::block_size_for(32).unwrap(), MIN_BLOCK_SIZE);
    assert_eq!(Heap::block_size_for(33).unwrap(), 64);
    assert_eq!(Heap::block_size_for(40).unwrap(), 64);
    assert_eq!(Heap::block_size_for(200).unwrap(), 224);
    assert_eq!(Heap::block_size_for(5000).unwrap(), 5024);
    assert!(matches!(
      Heap::block_size_for(usize::MAX),
      Err(Error::RequestTooLarge { request: usize::MAX })
    ));
    assert!(Heap::block_size_for(isize::MAX as usize).is_err());
  }

  #[test]
  fn test_allocations_are_aligned_and_large_enough() {
    let mut heap = heap(1 << 20);
    for size in [0, 1, 7, 15, 16, 17, 31, 32, 33, 47, 48, 100, 255, 1000, 4097] {
      let ptr = heap.allocate(size).unwrap();
      assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 0, "size {size}");
      assert!(unsafe { heap.usable_size(ptr) } >= size);
      fill(ptr, size, size as u8);
    }
    assert_consistent(&heap);
  }

  #[test]
  fn test_freed_block_is_reused_before_growing() {
    let mut heap = heap(1 << 20);

    let p1 = heap.allocate(40).unwrap();
    assert_eq!(p1.as_ptr().addr() % ALIGNMENT, 0);
    assert_eq!(block_of(p1), heap.arena().lower_bound().as_ptr().addr() + MIN_BLOCK_SIZE);

    let before = heap.arena().len();
    let p2 = heap.allocate(5000).unwrap();
    assert!(heap.arena().len() > before);
    assert_ne!(p1, p2);
    assert!(p1.as_ptr().addr() + unsafe { heap.usable_size(p1) } <= block_of(p2));

    unsafe { heap.deallocate(p1).unwrap() };
    assert_consistent(&heap);

    let len = heap.arena().len();
    let p3 = heap.allocate(40).unwrap();
    assert_eq!(p3, p1);
    assert_eq!(heap.arena().len(), len);
    assert_consistent(&heap);
  }

  #[test]
  fn test_double_free_is_reported_and_harmless() {
    let mut heap = heap(1 << 16);
    let p = heap.allocate(100).unwrap();
    let guard = heap.allocate(100).unwrap();

    unsafe {
      heap.deallocate(p).unwrap();
      let stats = heap.stats();

      let err = heap.deallocate(p).unwrap_err();
      assert!(matches!(err, Error::DoubleFree { addr } if addr == block_of(p)));
      assert_eq!(heap.stats(), stats);
    }
    assert_consistent(&heap);

    let q = heap.allocate(100).unwrap();
    assert_eq!(q, p);
    let r = heap.allocate(100).unwrap();
    assert_ne!(r, q);
    assert_ne!(r, guard);
    assert_consistent(&heap);
  }

  #[test]
  fn test_double_free_detected_after_forward_merge() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    let _guard = heap.allocate(40).unwrap();

    unsafe {
      heap.deallocate(b).unwrap();
      // `a` absorbs `b` and keeps its own header, now marked free
      heap.deallocate(a).unwrap();
      let stats = heap.stats();

      assert!(matches!(
        heap.deallocate(a),
        Err(Error::DoubleFree { addr }) if addr == block_of(a)
      ));
      assert_eq!(heap.stats(), stats);
    }
    assert_eq!(heap.stats().tracked_bytes, 128);
    assert_consistent(&heap);
  }

  #[test]
  fn test_shrink_in_place_then_reuse_remainder() {
    let mut heap = heap(1 << 16);
    let p = heap.allocate(200).unwrap();

    let shrunk = unsafe { heap.resize(Some(p), 50).unwrap() };
    assert_eq!(shrunk, Some(p));
    assert_consistent(&heap);
    assert_eq!(heap.stats().tracked_blocks, 1);
    assert_eq!(heap.stats().tracked_bytes, 224 - 80);

    let len = heap.arena().len();
    let q = heap.allocate(16).unwrap();
    assert_eq!(block_of(q), block_of(p) + 80);
    assert_eq!(heap.arena().len(), len);
    assert_consistent(&heap);
  }

  #[test]
  fn test_freeing_neighbors_coalesces() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    let c = heap.allocate(40).unwrap();

    unsafe {
      heap.deallocate(b).unwrap();
      heap.deallocate(c).unwrap();
    }

    let report = heap.check(true);
    assert!(report.is_consistent(), "{report}");
    assert_eq!(report.blocks, 2);
    assert_eq!(report.free_blocks, 1);
    assert_eq!(report.tree_nodes, 1);

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert_eq!(blocks, vec![
      BlockInfo {
        addr: block_of(a),
        size: 64,
        free: false,
      },
      BlockInfo {
        addr: block_of(b),
        size: 128,
        free: true,
      },
    ]);
  }

  #[test]
  fn test_free_coalesces_both_sides() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(200).unwrap();
    let _guard = heap.allocate(40).unwrap();

    unsafe {
      heap.deallocate(a).unwrap();
      heap.deallocate(c).unwrap();
      assert_eq!(heap.stats().tracked_blocks, 2);

      heap.deallocate(b).unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.tracked_blocks, 1);
    assert_eq!(stats.tracked_bytes, 64 + 128 + 224);
    assert_eq!(stats.allocated_blocks, 1);
    assert_consistent(&heap);

    // the merged block starts where `a` did
    let big = heap.allocate(64 + 128 + 224 - HEADER_SIZE).unwrap();
    assert_eq!(big, a);
  }

  #[test]
  fn test_best_fit_prefers_smallest_block() {
    let mut heap = heap(1 << 16);
    let big = heap.allocate(500).unwrap();
    let _g1 = heap.allocate(16).unwrap();
    let small = heap.allocate(100).unwrap();
    let _g2 = heap.allocate(16).unwrap();
    let medium = heap.allocate(300).unwrap();
    let _g3 = heap.allocate(16).unwrap();

    unsafe {
      heap.deallocate(big).unwrap();
      heap.deallocate(small).unwrap();
      heap.deallocate(medium).unwrap();
    }

    assert_eq!(heap.allocate(90).unwrap(), small);
    assert_eq!(heap.allocate(250).unwrap(), medium);
    assert_eq!(heap.allocate(400).unwrap(), big);
    assert_consistent(&heap);
  }

  #[test]
  fn test_growth_reuses_free_topmost_block() {
    let mut heap = heap(1 << 16);
    let _a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    unsafe { heap.deallocate(b).unwrap() };

    let len = heap.arena().len();
    let c = heap.allocate(100).unwrap();
    assert_eq!(c, b);
    assert_eq!(heap.arena().len(), len + 128 - 64);
    assert_consistent(&heap);
  }

  #[test]
  fn test_split_remainder_below_minimum_is_abandoned() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(100).unwrap();
    let _guard = heap.allocate(16).unwrap();
    unsafe { heap.deallocate(a).unwrap() };

    let b = heap.allocate(90).unwrap();
    assert_eq!(b, a);
    let stats = heap.stats();
    assert_eq!(stats.fragment_blocks, 1);
    assert_eq!(stats.fragment_bytes, 16);
    assert_eq!(stats.tracked_blocks, 0);
    assert_consistent(&heap);

    // freeing the neighbor folds the fragment back in
    unsafe { heap.deallocate(b).unwrap() };
    let stats = heap.stats();
    assert_eq!(stats.fragment_blocks, 0);
    assert_eq!(stats.tracked_bytes, 128);
    assert_consistent(&heap);
  }

  #[test]
  fn test_split_remainder_below_minimum_is_absorbed() {
    let mut heap = absorbing_heap(1 << 16);
    let a = heap.allocate(100).unwrap();
    let _guard = heap.allocate(16).unwrap();
    unsafe { heap.deallocate(a).unwrap() };

    let b = heap.allocate(90).unwrap();
    assert_eq!(b, a);
    assert_eq!(unsafe { heap.usable_size(b) }, 128 - HEADER_SIZE);
    let stats = heap.stats();
    assert_eq!(stats.fragment_blocks, 0);
    assert_eq!(stats.tracked_blocks, 0);
    assert_consistent(&heap);
  }

  #[test]
  fn test_out_of_memory_is_recoverable() {
    let mut heap = heap(PROLOGUE_BYTES + 64);
    let a = heap.allocate(40).unwrap();

    let err = heap.allocate(40).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(matches!(err, Error::OutOfMemory { request: 40, .. }));
    assert_consistent(&heap);

    unsafe { heap.deallocate(a).unwrap() };
    assert_eq!(heap.allocate(40).unwrap(), a);
  }

  #[test]
  fn test_failed_growth_keeps_topmost_block_tracked() {
    let mut heap = heap(PROLOGUE_BYTES + 64 + 32);
    let a = heap.allocate(40).unwrap();
    unsafe { heap.deallocate(a).unwrap() };

    assert!(heap.allocate(100).unwrap_err().is_out_of_memory());
    assert_eq!(heap.stats().tracked_blocks, 1);
    assert_consistent(&heap);

    assert_eq!(heap.allocate(60).unwrap(), a);
    assert_consistent(&heap);
  }

  #[test]
  fn test_oversized_request() {
    let mut heap = heap(1024);
    assert!(matches!(
      heap.allocate(usize::MAX - 8),
      Err(Error::RequestTooLarge { .. })
    ));
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_none_and_zero() {
    let mut heap = heap(1 << 16);

    let p = unsafe { heap.resize(None, 24).unwrap() }.unwrap();
    assert!(unsafe { heap.usable_size(p) } >= 24);

    let _guard = heap.allocate(16).unwrap();
    assert_eq!(unsafe { heap.resize(Some(p), 0).unwrap() }, None);
    assert_eq!(heap.stats().tracked_blocks, 1);
    assert!(matches!(
      unsafe { heap.deallocate(p) },
      Err(Error::DoubleFree { .. })
    ));
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_topmost_grows_in_place() {
    let mut heap = heap(1 << 16);
    let _a = heap.allocate(40).unwrap();
    let p = heap.allocate(40).unwrap();
    fill(p, 40, 7);

    let len = heap.arena().len();
    let q = unsafe { heap.resize(Some(p), 1000).unwrap() }.unwrap();
    assert_eq!(q, p);
    assert!(unsafe { heap.usable_size(q) } >= 1000);
    assert_eq!(heap.arena().len(), len + 1024 - 64);
    assert!(holds(q, 40, 7));
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_grows_into_free_neighbor() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(200).unwrap();
    let _guard = heap.allocate(40).unwrap();
    fill(a, 40, 3);
    unsafe { heap.deallocate(b).unwrap() };

    let len = heap.arena().len();
    let q = unsafe { heap.resize(Some(a), 100).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert_eq!(heap.arena().len(), len);
    assert!(holds(q, 40, 3));

    let stats = heap.stats();
    assert_eq!(stats.tracked_blocks, 1);
    assert_eq!(stats.tracked_bytes, 64 + 224 - 128);
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_grows_into_exactly_fitting_neighbor() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(48).unwrap();
    let _guard = heap.allocate(40).unwrap();
    unsafe { heap.deallocate(b).unwrap() };

    let q = unsafe { heap.resize(Some(a), 112).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert_eq!(unsafe { heap.usable_size(q) }, 128 - HEADER_SIZE);
    assert_eq!(heap.stats().tracked_blocks, 0);
    assert_eq!(heap.stats().fragment_blocks, 0);
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_into_neighbor_leaves_fragment_per_policy() {
    for (mut heap, fragments) in [(heap(1 << 16), 1), (absorbing_heap(1 << 16), 0)] {
      let a = heap.allocate(40).unwrap();
      let b = heap.allocate(64).unwrap();
      let _guard = heap.allocate(40).unwrap();
      unsafe { heap.deallocate(b).unwrap() };

      let q = unsafe { heap.resize(Some(a), 100).unwrap() }.unwrap();
      assert_eq!(q, a);
      assert_eq!(heap.stats().fragment_blocks, fragments);
      assert_eq!(heap.stats().tracked_blocks, 0);
      assert_consistent(&heap);
    }
  }

  #[test]
  fn test_resize_extends_through_free_topmost_neighbor() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    fill(a, 40, 11);
    unsafe { heap.deallocate(b).unwrap() };

    let q = unsafe { heap.resize(Some(a), 400).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert_eq!(heap.arena().len(), PROLOGUE_BYTES + 416);
    assert!(holds(q, 40, 11));
    assert_eq!(heap.stats().tracked_blocks, 0);
    assert_consistent(&heap);
  }

  #[test]
  fn test_resize_moves_as_last_resort() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    let _guard = heap.allocate(40).unwrap();
    fill(a, 40, 21);
    unsafe { heap.deallocate(b).unwrap() };

    let q = unsafe { heap.resize(Some(a), 400).unwrap() }.unwrap();
    assert_ne!(q, a);
    assert!(holds(q, 40, 21));

    // the old block merged with its free neighbor
    let stats = heap.stats();
    assert_eq!(stats.tracked_blocks, 1);
    assert_eq!(stats.tracked_bytes, 128);
    assert_consistent(&heap);
  }

  #[test]
  fn test_failed_relocation_keeps_original() {
    let mut heap = heap(PROLOGUE_BYTES + 64 + 64);
    let a = heap.allocate(40).unwrap();
    let _guard = heap.allocate(40).unwrap();
    fill(a, 40, 5);

    let err = unsafe { heap.resize(Some(a), 400) }.unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(holds(a, 40, 5));
    assert_eq!(heap.stats().allocated_blocks, 2);
    assert_consistent(&heap);
  }

  #[test]
  fn test_topmost_resize_falls_back_to_free_block() {
    let mut heap = heap(PROLOGUE_BYTES + 416 + 64 + 64);
    let a = heap.allocate(400).unwrap();
    let _guard = heap.allocate(40).unwrap();
    let p = heap.allocate(40).unwrap();
    fill(p, 40, 17);
    unsafe { heap.deallocate(a).unwrap() };
    assert_eq!(heap.arena().len(), PROLOGUE_BYTES + 416 + 64 + 64);

    let q = unsafe { heap.resize(Some(p), 300).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert!(holds(q, 40, 17));
    assert!(unsafe { heap.usable_size(q) } >= 300);
    assert_eq!(heap.arena().len(), PROLOGUE_BYTES + 416 + 64 + 64);

    // the split tail of `a` and the old topmost block are both free again
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 2);
    assert_eq!(stats.tracked_blocks, 2);
    assert_eq!(stats.tracked_bytes, 416 - 320 + 64);
    assert_consistent(&heap);
  }

  #[test]
  fn test_topmost_resize_without_room_anywhere_keeps_original() {
    let mut heap = heap(PROLOGUE_BYTES + 64 + 64);
    let _guard = heap.allocate(40).unwrap();
    let p = heap.allocate(40).unwrap();
    fill(p, 40, 19);

    let err = unsafe { heap.resize(Some(p), 300) }.unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(holds(p, 40, 19));
    assert_eq!(unsafe { heap.usable_size(p) }, 48);
    assert_consistent(&heap);
  }

  #[test]
  fn test_shrink_coalesces_with_free_neighbor() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(200).unwrap();
    let b = heap.allocate(100).unwrap();
    let _guard = heap.allocate(40).unwrap();
    fill(a, 50, 9);
    unsafe { heap.deallocate(b).unwrap() };

    let q = unsafe { heap.resize(Some(a), 50).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert!(holds(q, 50, 9));

    let stats = heap.stats();
    assert_eq!(stats.tracked_blocks, 1);
    assert_eq!(stats.tracked_bytes, 224 - 80 + 128);
    assert_consistent(&heap);
  }

  #[test]
  fn test_shrink_by_less_than_minimum() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(48).unwrap();
    let b = heap.allocate(40).unwrap();

    let q = unsafe { heap.resize(Some(a), 30).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert_eq!(heap.stats().fragment_blocks, 1);
    assert_consistent(&heap);

    unsafe { heap.deallocate(b).unwrap() };
    let stats = heap.stats();
    assert_eq!(stats.fragment_blocks, 0);
    assert_eq!(stats.tracked_bytes, 16 + 64);
    assert_consistent(&heap);
  }

  #[test]
  fn test_shrink_to_same_block_size_is_noop() {
    let mut heap = heap(1 << 16);
    let a = heap.allocate(100).unwrap();
    let _guard = heap.allocate(40).unwrap();
    let stats = heap.stats();

    let q = unsafe { heap.resize(Some(a), 97).unwrap() }.unwrap();
    assert_eq!(q, a);
    assert_eq!(heap.stats(), stats);
  }

  #[test]
  fn test_resize_round_trip_preserves_prefix() {
    let mut heap = heap(1 << 20);
    let _before = heap.allocate(64).unwrap();
    let p = heap.allocate(100).unwrap();
    let _after = heap.allocate(64).unwrap();
    fill(p, 100, 42);

    unsafe {
      let p = heap.resize(Some(p), 3000).unwrap().unwrap();
      assert!(holds(p, 100, 42));
      let p = heap.resize(Some(p), 120).unwrap().unwrap();
      assert!(holds(p, 100, 42));
      let p = heap.resize(Some(p), 100).unwrap().unwrap();
      assert!(holds(p, 100, 42));
    }
    assert_consistent(&heap);
  }

  /// xorshift64, enough for a reproducible workload.
  struct Rng(u64);

  impl Rng {
    fn next(&mut self) -> u64 {
      self.0 ^= self.0 << 13;
      self.0 ^= self.0 >> 7;
      self.0 ^= self.0 << 17;
      self.0
    }

    fn below(
      &mut self,
      bound: usize,
    ) -> usize {
      (self.next() % bound as u64) as usize
    }
  }

  fn run_random_workload(
    mut heap: TreeAllocator<FixedArena>,
    seed: u64,
  ) {
    let mut rng = Rng(seed);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for step in 0..3000 {
      match rng.below(10) {
        0..=4 => {
          let bound = if rng.below(8) == 0 { 4000 } else { 300 };
          let size = 1 + rng.below(bound);
          let ptr = heap.allocate(size).unwrap();
          assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 0);
          let seed = step as u8;
          fill(ptr, size, seed);
          live.push((ptr, size, seed));
        }
        5..=7 if !live.is_empty() => {
          let (ptr, size, seed) = live.swap_remove(rng.below(live.len()));
          assert!(holds(ptr, size, seed), "step {step}");
          unsafe { heap.deallocate(ptr).unwrap() };
        }
        8..=9 if !live.is_empty() => {
          let index = rng.below(live.len());
          let (ptr, size, seed) = live[index];
          let new_size = 1 + rng.below(600);
          let moved = unsafe { heap.resize(Some(ptr), new_size).unwrap() }.unwrap();
          let kept = size.min(new_size);
          assert!(holds(moved, kept, seed), "step {step}");
          fill(moved, new_size, seed);
          live[index] = (moved, new_size, seed);
        }
        _ => {}
      }

      if step % 7 == 0 {
        let report = heap.check(false);
        assert!(report.is_consistent(), "step {step}: {report}");
      }
    }

    // every live allocation still maps onto an allocated block
    let allocated: Vec<usize> = heap.blocks().filter(|info| !info.free).map(|info| info.addr).collect();
    assert_eq!(allocated.len(), live.len());
    for &(ptr, size, seed) in &live {
      assert!(allocated.contains(&block_of(ptr)));
      assert!(holds(ptr, size, seed));
    }

    for (ptr, _, _) in live.drain(..) {
      unsafe { heap.deallocate(ptr).unwrap() };
    }
    let report = heap.check(false);
    assert!(report.is_consistent(), "{report}");
    assert!(report.free_blocks <= 1);
    assert_eq!(heap.stats().allocated_blocks, 0);
  }

  #[test]
  fn test_random_workload_stays_consistent() {
    run_random_workload(heap(1 << 24), 0x2545_f491_4f6c_dd1d);
  }

  #[test]
  fn test_random_workload_stays_consistent_when_absorbing() {
    run_random_workload(absorbing_heap(1 << 24), 0x9e37_79b9_7f4a_7c15);
  }
}
