//! Free-block index: a red-black tree whose nodes are the free blocks.
//!
//! Nodes live inside the free blocks they describe (see [`crate::block`]),
//! so the index needs no storage of its own. The tree is keyed on
//! [`Block::order_key`]: block size, ties broken by address.
//!
//! A sentinel block plays two roles. It is the black "null" leaf every
//! missing child points to, and it is the super-root: the true root hangs off
//! its left link, so every real node has a parent and rotations never need
//! to special-case the root.
//!
//! ```text
//!            sentinel ──left──▶ root
//!                                │
//!                   ┌────────────┴────────────┐
//!                 (48)                       (96)
//!              ┌────┴────┐               ┌────┴────┐
//!          sentinel   sentinel        (64)      (224)
//! ```

use crate::block::Block;

/// Handle to a free-block tree rooted at a sentinel block.
///
/// The handle itself is just the sentinel address; every operation reads and
/// writes the links stored inside the arena. All operations are `unsafe`:
/// callers promise that the sentinel and every linked block are valid,
/// at least [`MIN_BLOCK_SIZE`](crate::block::MIN_BLOCK_SIZE) long, and not
/// touched by anybody else while linked.
#[derive(Debug)]
pub struct FreeTree {
  nil: Block,
}

impl FreeTree {
  /// Turns `nil` into an empty tree's sentinel.
  ///
  /// # Safety
  ///
  /// `nil` must point to at least `MIN_BLOCK_SIZE` writable bytes that are
  /// never handed out as an allocation.
  pub unsafe fn new(nil: Block) -> Self {
    unsafe {
      nil.set_left(nil);
      nil.set_right(nil);
      nil.set_parent(nil);
      nil.set_red(false);
    }
    Self { nil }
  }

  pub fn sentinel(&self) -> Block {
    self.nil
  }

  /// # Safety
  ///
  /// See [`FreeTree`].
  pub unsafe fn root(&self) -> Option<Block> {
    let root = unsafe { self.nil.left() };
    (root != self.nil).then_some(root)
  }

  /// # Safety
  ///
  /// See [`FreeTree`].
  pub unsafe fn is_empty(&self) -> bool {
    unsafe { self.root().is_none() }
  }

  /// Number of linked blocks. Walks the whole tree.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`].
  pub unsafe fn len(&self) -> usize {
    unsafe { self.iter() }.count()
  }

  /// Returns the smallest block whose size is at least `size`.
  ///
  /// Ties go to the lowest address, since that is the smallest key at or
  /// above `(size, 0)`.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`].
  pub unsafe fn find_best_fit(
    &self,
    size: usize,
  ) -> Option<Block> {
    unsafe {
      let mut node = self.nil.left();
      let mut best = None;

      while node != self.nil {
        if node.size() < size {
          node = node.right();
        } else {
          best = Some(node);
          node = node.left();
        }
      }

      best
    }
  }

  /// Returns `true` if `block` is linked into the tree.
  ///
  /// Follows the same descent as [`FreeTree::insert`], so a block whose size
  /// changed after insertion is reported missing.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`]. `block`'s header must be readable.
  pub unsafe fn find_exact(
    &self,
    block: Block,
  ) -> bool {
    unsafe {
      let key = block.order_key();
      let mut node = self.nil.left();

      while node != self.nil {
        if node == block {
          return true;
        }
        node = if key < node.order_key() {
          node.left()
        } else {
          node.right()
        };
      }

      false
    }
  }

  /// In-order successor of a linked `node`.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`]. `node` must be linked.
  pub unsafe fn successor(
    &self,
    node: Block,
  ) -> Option<Block> {
    unsafe {
      let right = node.right();
      if right != self.nil {
        return Some(self.minimum(right));
      }

      let mut node = node;
      let mut parent = node.parent();
      while parent != self.nil && node == parent.right() {
        node = parent;
        parent = parent.parent();
      }

      (parent != self.nil).then_some(parent)
    }
  }

  unsafe fn minimum(
    &self,
    node: Block,
  ) -> Block {
    unsafe {
      let mut node = node;
      let mut left = node.left();
      while left != self.nil {
        node = left;
        left = node.left();
      }
      node
    }
  }

  /// Links a free block into the tree.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`]. `node` must be a free block of at least
  /// `MIN_BLOCK_SIZE` bytes that is not already linked.
  pub unsafe fn insert(
    &mut self,
    node: Block,
  ) {
    unsafe {
      debug_assert!(node.is_tracked(), "only trackable free blocks can be linked");

      let nil = self.nil;
      let key = node.order_key();
      node.set_left(nil);
      node.set_right(nil);

      let mut parent = nil;
      let mut child = nil.left();
      while child != nil {
        parent = child;
        child = if key < child.order_key() {
          child.left()
        } else {
          child.right()
        };
      }

      node.set_parent(parent);
      if parent == nil || key < parent.order_key() {
        parent.set_left(node);
      } else {
        parent.set_right(node);
      }

      node.set_red(true);
      self.insert_fixup(node);
    }
  }

  unsafe fn insert_fixup(
    &mut self,
    node: Block,
  ) {
    unsafe {
      let mut node = node;

      while node.parent().is_red() {
        let parent = node.parent();
        let grandparent = parent.parent();

        if parent == grandparent.left() {
          let uncle = grandparent.right();
          if uncle.is_red() {
            parent.set_red(false);
            uncle.set_red(false);
            grandparent.set_red(true);
            node = grandparent;
          } else {
            if node == parent.right() {
              node = parent;
              self.rotate_left(node);
            }
            node.parent().set_red(false);
            node.parent().parent().set_red(true);
            self.rotate_right(node.parent().parent());
          }
        } else {
          let uncle = grandparent.left();
          if uncle.is_red() {
            parent.set_red(false);
            uncle.set_red(false);
            grandparent.set_red(true);
            node = grandparent;
          } else {
            if node == parent.left() {
              node = parent;
              self.rotate_right(node);
            }
            node.parent().set_red(false);
            node.parent().parent().set_red(true);
            self.rotate_left(node.parent().parent());
          }
        }
      }

      self.nil.left().set_red(false);
    }
  }

  /// Unlinks `node` from the tree.
  ///
  /// A node with two children is replaced by its in-order successor, which
  /// is spliced out of its own position first. The tree keeps no payload
  /// besides the block itself, so the successor takes over `node`'s links and
  /// color rather than the other way around.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`]. `node` must be linked.
  pub unsafe fn delete(
    &mut self,
    node: Block,
  ) {
    unsafe {
      let nil = self.nil;

      let target = if node.left() == nil || node.right() == nil {
        node
      } else {
        self.minimum(node.right())
      };

      let child = if target.left() == nil {
        target.right()
      } else {
        target.left()
      };

      // `child` may be the sentinel; its parent link is scratch space the
      // fixup reads back.
      let parent = target.parent();
      child.set_parent(parent);
      self.replace_child(parent, target, child);

      if !target.is_red() {
        self.delete_fixup(child);
      }

      if target != node {
        target.set_left(node.left());
        target.set_right(node.right());
        target.set_parent(node.parent());
        target.set_red(node.is_red());
        node.left().set_parent(target);
        node.right().set_parent(target);
        self.replace_child(node.parent(), node, target);
      }
    }
  }

  unsafe fn delete_fixup(
    &mut self,
    node: Block,
  ) {
    unsafe {
      let mut node = node;

      while node != self.nil.left() && !node.is_red() {
        let parent = node.parent();

        if node == parent.left() {
          let mut sibling = parent.right();
          if sibling.is_red() {
            sibling.set_red(false);
            parent.set_red(true);
            self.rotate_left(parent);
            sibling = parent.right();
          }

          if !sibling.left().is_red() && !sibling.right().is_red() {
            sibling.set_red(true);
            node = parent;
          } else {
            if !sibling.right().is_red() {
              sibling.left().set_red(false);
              sibling.set_red(true);
              self.rotate_right(sibling);
              sibling = parent.right();
            }
            sibling.set_red(parent.is_red());
            parent.set_red(false);
            sibling.right().set_red(false);
            self.rotate_left(parent);
            node = self.nil.left();
          }
        } else {
          let mut sibling = parent.left();
          if sibling.is_red() {
            sibling.set_red(false);
            parent.set_red(true);
            self.rotate_right(parent);
            sibling = parent.left();
          }

          if !sibling.left().is_red() && !sibling.right().is_red() {
            sibling.set_red(true);
            node = parent;
          } else {
            if !sibling.left().is_red() {
              sibling.right().set_red(false);
              sibling.set_red(true);
              self.rotate_left(sibling);
              sibling = parent.left();
            }
            sibling.set_red(parent.is_red());
            parent.set_red(false);
            sibling.left().set_red(false);
            self.rotate_right(parent);
            node = self.nil.left();
          }
        }
      }

      node.set_red(false);
    }
  }

  /// Points whichever link of `parent` referenced `old` at `new`. The
  /// sentinel's left link is the root slot.
  unsafe fn replace_child(
    &mut self,
    parent: Block,
    old: Block,
    new: Block,
  ) {
    unsafe {
      if parent.left() == old {
        parent.set_left(new);
      } else {
        parent.set_right(new);
      }
    }
  }

  unsafe fn rotate_left(
    &mut self,
    node: Block,
  ) {
    unsafe {
      let right = node.right();
      let inner = right.left();

      node.set_right(inner);
      if inner != self.nil {
        inner.set_parent(node);
      }

      let parent = node.parent();
      right.set_parent(parent);
      self.replace_child(parent, node, right);

      right.set_left(node);
      node.set_parent(right);
    }
  }

  unsafe fn rotate_right(
    &mut self,
    node: Block,
  ) {
    unsafe {
      let left = node.left();
      let inner = left.right();

      node.set_left(inner);
      if inner != self.nil {
        inner.set_parent(node);
      }

      let parent = node.parent();
      left.set_parent(parent);
      self.replace_child(parent, node, left);

      left.set_right(node);
      node.set_parent(left);
    }
  }

  /// Iterates the linked blocks in ascending `(size, address)` order.
  ///
  /// # Safety
  ///
  /// See [`FreeTree`]. The tree must not change while the iterator is alive.
  pub unsafe fn iter(&self) -> Iter<'_> {
    let next = unsafe { self.root().map(|root| self.minimum(root)) };
    Iter { tree: self, next }
  }
}

/// In-order iterator over a [`FreeTree`].
pub struct Iter<'a> {
  tree: &'a FreeTree,
  next: Option<Block>,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Self::Item> {
    let current = self.next?;
    // SAFETY: upheld by the caller of `FreeTree::iter`.
    self.next = unsafe { self.tree.successor(current) };
    Some(current)
  }
}
