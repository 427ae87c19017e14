//! # rbtalloc - A Best-Fit Red-Black Tree Allocator
//!
//! This crate provides a dynamic memory allocator managing one contiguous,
//! growable arena. Free blocks are indexed by size in a **red-black tree whose
//! nodes are the free blocks themselves**, giving best-fit allocation in
//! `O(log n)` with no bookkeeping memory outside the arena.
//!
//! ## Overview
//!
//! ```text
//!   Arena:
//!
//!   ┌──────────┬────────┬───────────────┬────────┬──────┬────────────┬───┐
//!   │ prologue │ used   │ free (tree)   │ used   │ free │ used       │ E │
//!   └──────────┴────────┴───────────────┴────────┴──────┴────────────┴───┘
//!        ▲                     ▲                    ▲                   ▲
//!        │                     │                    │                   │
//!    tree sentinel       tree node           untracked fragment    epilogue
//!    and super-root      (>= 48 bytes)       (< 48 bytes)          word
//!
//!   Free-block tree (keyed on size, ties broken by address):
//!
//!                    ┌─────────┐
//!                    │ 96 (B)  │
//!                    └────┬────┘
//!              ┌──────────┴──────────┐
//!         ┌────┴────┐           ┌────┴────┐
//!         │ 48 (R)  │           │ 224 (R) │
//!         └─────────┘           └─────────┘
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rbtalloc
//!   ├── align      - Alignment macro and helpers (align!)
//!   ├── arena      - ArenaProvider trait, FixedArena, SbrkArena
//!   ├── block      - Block codec: header words, tags, tree links
//!   ├── tree       - FreeTree, the intrusive red-black tree
//!   ├── heap       - TreeAllocator: allocate, deallocate, resize
//!   ├── check      - Consistency checker
//!   ├── config     - Config and SplitPolicy
//!   └── error      - Error type
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rbtalloc::{FixedArena, TreeAllocator};
//!
//! let arena = FixedArena::with_capacity(64 * 1024).unwrap();
//! let mut heap = TreeAllocator::new(arena).unwrap();
//!
//! let ptr = heap.allocate(40).unwrap();
//! unsafe {
//!     ptr.cast::<u64>().write(42);
//!     let ptr = heap.resize(Some(ptr), 400).unwrap().unwrap();
//!     assert_eq!(ptr.cast::<u64>().read(), 42);
//!     heap.deallocate(ptr).unwrap();
//! }
//!
//! assert!(heap.check(false).is_consistent());
//! ```
//!
//! ## How It Works
//!
//! Every block starts with two words: a copy of the previous block's size
//! and free bit, then its own. Sizes are multiples of 16, so bit 0 of each
//! word is free to hold the free flag.
//!
//! ```text
//!   Single Allocation:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         User Data              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ prev size  |F   │  │  ┌──────────────────────────┐  │
//!   │  │ own size   |F   │  │  │   size - 16 bytes usable │  │
//!   │  └─────────────────┘  │  └──────────────────────────┘  │
//!   │      16 bytes         │                                │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user (16-byte aligned)
//! ```
//!
//! - **allocate** asks the tree for the smallest block that fits, splits off
//!   the tail, and only grows the arena when nothing fits (reusing a free
//!   topmost block for part of the growth).
//! - **deallocate** coalesces with free neighbors on both sides before
//!   linking the merged block into the tree.
//! - **resize** shrinks and grows in place whenever the neighborhood allows
//!   and moves data only as a last resort.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization primitives
//! - **Growth only**: The arena is never returned to the provider
//! - **Trusted headers**: Corrupted headers are not defended against
//! - **Fixed alignment**: Every allocation is aligned to 16 bytes
//!
//! ## Safety
//!
//! Allocation is safe to call; freeing and resizing take raw pointers and are
//! `unsafe`. [`SbrkArena`] moves the real program break and must not be
//! mixed with anything else that does.

pub mod align;
pub mod arena;
pub mod block;
mod check;
mod config;
mod error;
mod heap;
pub mod tree;

pub use arena::{ArenaError, ArenaProvider, FixedArena, SbrkArena};
pub use check::{CheckReport, Violation};
pub use config::{Config, SplitPolicy};
pub use error::Error;
pub use heap::{BlockInfo, Blocks, HeapStats, TreeAllocator};
