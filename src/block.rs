//! Block codec: the in-memory header format and fixed-offset accessors.
//!
//! ```text
//!   Allocated block:                     Free block (size >= MIN_BLOCK_SIZE):
//!
//!   +0  ┌──────────────────────────┐     +0  ┌──────────────────────────┐
//!       │ prev size           |0|F │         │ prev size           |0|F │
//!   +8  ├──────────────────────────┤     +8  ├──────────────────────────┤
//!       │ own size            |0|F │         │ own size            |0|1 │
//!   +16 ├──────────────────────────┤     +16 ├──────────────────────────┤
//!       │                          │         │ left child               │
//!       │ user data                │     +24 ├──────────────────────────┤
//!       │                          │         │ right child              │
//!       │                          │     +32 ├──────────────────────────┤
//!       │                          │         │ parent                   │
//!       │                          │     +40 ├──────────────────────────┤
//!       │                          │         │ garbage               |R │
//!       │                          │     +48 ├──────────────────────────┤
//!       │                          │         │ garbage                  │
//!   +N  └──────────────────────────┘     +N  └──────────────────────────┘
//! ```
//!
//! The "prev size" word of a block is the boundary copy of the previous
//! block's own word, so a block never carries a trailing footer.

use core::{fmt, ptr::NonNull};

use crate::align::{ALIGNMENT, is_aligned};

/// Width of one header word.
pub const WORD_SIZE: usize = 8;

/// Bytes in front of every user region: the boundary word and the own word.
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Smallest block able to carry the tree links and the color word.
pub const MIN_BLOCK_SIZE: usize = crate::align!(HEADER_SIZE + 4 * WORD_SIZE);

/// The end-of-arena marker is a lone boundary word.
pub const EPILOGUE_SIZE: usize = WORD_SIZE;

const _: () = assert!(MIN_BLOCK_SIZE == 48);
const _: () = assert!(is_aligned(HEADER_SIZE));
const _: () = assert!(size_of::<usize>() <= WORD_SIZE);
const _: () = assert!(size_of::<*mut u8>() <= WORD_SIZE);

const PREV_TAG_OFFSET: usize = 0;
const TAG_OFFSET: usize = WORD_SIZE;
const LEFT_OFFSET: usize = HEADER_SIZE;
const RIGHT_OFFSET: usize = HEADER_SIZE + WORD_SIZE;
const PARENT_OFFSET: usize = HEADER_SIZE + 2 * WORD_SIZE;
const COLOR_OFFSET: usize = HEADER_SIZE + 3 * WORD_SIZE;

const RED_BIT: usize = 0x1;

/// A block size and its free bit packed into one word.
///
/// Sizes are multiples of [`ALIGNMENT`], which leaves the low bits of the
/// word for flags. Only bit 0 is used.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(usize);

impl Tag {
  const FREE_BIT: usize = 0x1;
  const FLAG_MASK: usize = ALIGNMENT - 1;

  /// Packs `size` and `free`.
  ///
  /// # Panics
  ///
  /// Panics in debug builds if `size` is not a multiple of [`ALIGNMENT`].
  pub const fn new(
    size: usize,
    free: bool,
  ) -> Self {
    debug_assert!(is_aligned(size), "block size must be aligned");
    Self(size | if free { Self::FREE_BIT } else { 0 })
  }

  /// Reinterprets a raw header word.
  pub const fn from_bits(bits: usize) -> Self {
    Self(bits)
  }

  /// Returns the raw header word.
  pub const fn bits(self) -> usize {
    self.0
  }

  pub const fn size(self) -> usize {
    self.0 & !Self::FLAG_MASK
  }

  pub const fn is_free(self) -> bool {
    self.0 & Self::FREE_BIT != 0
  }

  /// Returns the same size with the free bit replaced.
  pub const fn with_free(
    self,
    free: bool,
  ) -> Self {
    Self::new(self.size(), free)
  }
}

impl fmt::Debug for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("Tag")
      .field("size", &self.size())
      .field("free", &self.is_free())
      .finish()
  }
}

/// A typed view over the start address of a block inside the arena.
///
/// A `Block` is only an address; every accessor reads or writes one word at
/// a fixed offset from it. The accessors are `unsafe` because the view cannot
/// know whether the words it touches are inside the arena.
///
/// Blocks compare by address. [`Block::order_key`] gives the total order used
/// by the free-block tree: size first, then address, lower address first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(NonNull<u8>);

impl Block {
  /// Creates a view over the block starting at `start`.
  pub const fn at(start: NonNull<u8>) -> Self {
    Self(start)
  }

  /// Recovers the block owning the user region `user`.
  ///
  /// # Safety
  ///
  /// `user` must have been produced by [`Block::user_ptr`].
  pub unsafe fn from_user(user: NonNull<u8>) -> Self {
    Self(unsafe { user.sub(HEADER_SIZE) })
  }

  pub const fn start(self) -> NonNull<u8> {
    self.0
  }

  pub fn addr(self) -> usize {
    self.0.as_ptr().addr()
  }

  /// Start of the region handed out to callers.
  ///
  /// # Safety
  ///
  /// The block must be at least [`HEADER_SIZE`] bytes long.
  pub unsafe fn user_ptr(self) -> NonNull<u8> {
    unsafe { self.0.add(HEADER_SIZE) }
  }

  /// The view `offset` bytes past this block.
  ///
  /// # Safety
  ///
  /// The result must stay inside the arena (or be its epilogue).
  pub unsafe fn offset(
    self,
    offset: usize,
  ) -> Self {
    Self(unsafe { self.0.add(offset) })
  }

  /// Canonical tie-broken key of the free-block tree.
  ///
  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn order_key(self) -> (usize, usize) {
    (unsafe { self.size() }, self.addr())
  }

  unsafe fn word<T>(
    self,
    offset: usize,
  ) -> *mut T {
    debug_assert!(offset + size_of::<T>() <= MIN_BLOCK_SIZE);
    unsafe { self.0.add(offset) }.as_ptr().cast::<T>()
  }

  /// Reads the boundary copy of the previous block's own word.
  ///
  /// # Safety
  ///
  /// The block's first word must be inside the arena.
  pub unsafe fn prev_tag(self) -> Tag {
    Tag::from_bits(unsafe { self.word::<usize>(PREV_TAG_OFFSET).read() })
  }

  /// # Safety
  ///
  /// Same as [`Block::prev_tag`].
  pub unsafe fn set_prev_tag(
    self,
    tag: Tag,
  ) {
    unsafe { self.word::<usize>(PREV_TAG_OFFSET).write(tag.bits()) }
  }

  /// Reads this block's own size and free bit.
  ///
  /// # Safety
  ///
  /// The block's header must be inside the arena.
  pub unsafe fn tag(self) -> Tag {
    Tag::from_bits(unsafe { self.word::<usize>(TAG_OFFSET).read() })
  }

  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn set_tag(
    self,
    tag: Tag,
  ) {
    unsafe { self.word::<usize>(TAG_OFFSET).write(tag.bits()) }
  }

  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn size(self) -> usize {
    unsafe { self.tag().size() }
  }

  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn is_free(self) -> bool {
    unsafe { self.tag().is_free() }
  }

  /// A free block large enough to be a tree node.
  ///
  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn is_tracked(self) -> bool {
    let tag = unsafe { self.tag() };
    tag.is_free() && tag.size() >= MIN_BLOCK_SIZE
  }

  /// Writes `tag` into this block's header and into the boundary slot of the
  /// block that follows it, keeping both copies in agreement.
  ///
  /// # Safety
  ///
  /// Both `self` and `self + tag.size()` must be inside the arena; the
  /// latter may be the epilogue.
  pub unsafe fn set_boundary(
    self,
    tag: Tag,
  ) {
    unsafe {
      self.set_tag(tag);
      self.offset(tag.size()).set_prev_tag(tag);
    }
  }

  /// The block physically following this one.
  ///
  /// # Safety
  ///
  /// Same as [`Block::tag`].
  pub unsafe fn next(self) -> Self {
    unsafe { self.offset(self.size()) }
  }

  /// The block physically preceding this one, found through the boundary
  /// copy.
  ///
  /// # Safety
  ///
  /// The previous block must exist, i.e. `self` is not the prologue.
  pub unsafe fn prev(self) -> Self {
    Self(unsafe { self.0.sub(self.prev_tag().size()) })
  }

  unsafe fn link(
    self,
    offset: usize,
  ) -> Self {
    let raw = unsafe { self.word::<*mut u8>(offset).read() };
    // SAFETY: links are only ever written from other `Block`s.
    Self(unsafe { NonNull::new_unchecked(raw) })
  }

  unsafe fn set_link(
    self,
    offset: usize,
    target: Self,
  ) {
    unsafe { self.word::<*mut u8>(offset).write(target.0.as_ptr()) }
  }

  /// # Safety
  ///
  /// The block must be at least [`MIN_BLOCK_SIZE`] long and its links must
  /// have been written.
  pub unsafe fn left(self) -> Self {
    unsafe { self.link(LEFT_OFFSET) }
  }

  /// # Safety
  ///
  /// The block must be at least [`MIN_BLOCK_SIZE`] long.
  pub unsafe fn set_left(
    self,
    left: Self,
  ) {
    unsafe { self.set_link(LEFT_OFFSET, left) }
  }

  /// # Safety
  ///
  /// See [`Block::left`].
  pub unsafe fn right(self) -> Self {
    unsafe { self.link(RIGHT_OFFSET) }
  }

  /// # Safety
  ///
  /// See [`Block::set_left`].
  pub unsafe fn set_right(
    self,
    right: Self,
  ) {
    unsafe { self.set_link(RIGHT_OFFSET, right) }
  }

  /// # Safety
  ///
  /// See [`Block::left`].
  pub unsafe fn parent(self) -> Self {
    unsafe { self.link(PARENT_OFFSET) }
  }

  /// # Safety
  ///
  /// See [`Block::set_left`].
  pub unsafe fn set_parent(
    self,
    parent: Self,
  ) {
    unsafe { self.set_link(PARENT_OFFSET, parent) }
  }

  /// # Safety
  ///
  /// See [`Block::left`].
  pub unsafe fn is_red(self) -> bool {
    unsafe { self.word::<usize>(COLOR_OFFSET).read() & RED_BIT != 0 }
  }

  /// # Safety
  ///
  /// See [`Block::set_left`].
  pub unsafe fn set_red(
    self,
    red: bool,
  ) {
    unsafe { self.word::<usize>(COLOR_OFFSET).write(if red { RED_BIT } else { 0 }) }
  }
}

impl fmt::Debug for Block {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "Block({:p})", self.0)
  }
}
