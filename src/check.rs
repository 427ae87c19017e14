//! Consistency checker.
//!
//! Read-only walks over the arena and the free-block tree. Nothing here is
//! on the allocation path; tests and debugging sessions call
//! [`TreeAllocator::check`] between operations.

use core::fmt;

use crate::{
  arena::ArenaProvider,
  block::{Block, MIN_BLOCK_SIZE},
  heap::TreeAllocator,
  tree::FreeTree,
};

/// A broken invariant. Addresses are block starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  /// A tree node whose header says it is allocated.
  AllocatedInTree { block: usize },
  /// A tree node too small to hold its own links.
  UndersizedNode { block: usize, size: usize },
  /// A child whose parent link does not point back.
  BrokenLink { parent: usize, child: usize },
  /// In-order traversal is not ascending on `(size, address)`.
  OutOfOrder { node: usize, next: usize },
  RedRoot { root: usize },
  RedRed { parent: usize, child: usize },
  /// Left and right subtrees of `node` have different black heights.
  BlackHeight { node: usize, left: usize, right: usize },
  /// Two free blocks next to each other: a missed coalesce.
  AdjacentFree { first: usize, second: usize },
  /// A free block big enough for the tree that the tree does not contain.
  Untracked { block: usize, size: usize },
  /// The header of `block` and the copy kept by the next block disagree.
  BoundaryMismatch { block: usize, own: usize, copy: usize },
  /// The block walk did not land exactly on the epilogue.
  Overrun { block: usize, size: usize },
}

impl fmt::Display for Violation {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match *self {
      Self::AllocatedInTree { block } => write!(f, "{block:#x} is an allocated block in the free-block tree"),
      Self::UndersizedNode { block, size } => {
        write!(f, "{block:#x} is a tree node of only {size} bytes")
      }
      Self::BrokenLink { parent, child } => {
        write!(f, "{child:#x} is a child of {parent:#x} but does not point back")
      }
      Self::OutOfOrder { node, next } => write!(f, "{node:#x} and {next:#x} are out of order"),
      Self::RedRoot { root } => write!(f, "root {root:#x} is red"),
      Self::RedRed { parent, child } => write!(f, "{parent:#x} and its child {child:#x} are both red"),
      Self::BlackHeight { node, left, right } => {
        write!(f, "{node:#x} has black heights {left} (left) and {right} (right)")
      }
      Self::AdjacentFree { first, second } => write!(f, "{first:#x},{second:#x} are contiguous free blocks"),
      Self::Untracked { block, size } => {
        write!(f, "{block:#x} is a free block of {size} bytes not tracked by the tree")
      }
      Self::BoundaryMismatch { block, own, copy } => {
        write!(f, "{block:#x} has size word {own:#x} but its boundary copy is {copy:#x}")
      }
      Self::Overrun { block, size } => write!(f, "{block:#x} claims {size} bytes past the epilogue"),
    }
  }
}

/// Result of [`TreeAllocator::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
  pub violations: Vec<Violation>,
  /// Blocks visited by the arena walk, prologue excluded.
  pub blocks: usize,
  pub free_blocks: usize,
  pub tree_nodes: usize,
}

impl CheckReport {
  pub fn is_consistent(&self) -> bool {
    self.violations.is_empty()
  }
}

impl fmt::Display for CheckReport {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(
      f,
      "{} blocks, {} free, {} in tree: ",
      self.blocks, self.free_blocks, self.tree_nodes
    )?;
    if self.violations.is_empty() {
      return write!(f, "consistent");
    }
    write!(f, "{} violation(s)", self.violations.len())?;
    for violation in &self.violations {
      write!(f, "\n  {violation}")?;
    }
    Ok(())
  }
}

struct Collector {
  violations: Vec<Violation>,
  stop_on_first: bool,
}

impl Collector {
  fn new(stop_on_first: bool) -> Self {
    Self {
      violations: Vec::new(),
      stop_on_first,
    }
  }

  fn report(
    &mut self,
    violation: Violation,
  ) {
    if !self.is_done() {
      log::error!("{violation}");
      self.violations.push(violation);
    }
  }

  fn is_done(&self) -> bool {
    self.stop_on_first && !self.violations.is_empty()
  }
}

impl<A: ArenaProvider> TreeAllocator<A> {
  /// Validates the arena and the free-block tree.
  ///
  /// Checks that every tree node is free, that no two neighboring blocks are
  /// both free, that every free block of at least
  /// [`MIN_BLOCK_SIZE`] bytes is in the tree, that header words agree with
  /// their boundary copies, and that the tree is a well-formed red-black
  /// tree. With `verbose`, every block and every tree node is logged at
  /// debug level.
  pub fn check(
    &self,
    verbose: bool,
  ) -> CheckReport {
    let mut collector = Collector::new(self.config().stop_on_first_violation);
    let mut report = CheckReport::default();

    unsafe {
      check_tree(self.tree(), &mut collector);
      report.tree_nodes = self.tree().len();

      if verbose {
        log::debug!("free-block tree, in order:");
        for node in self.tree().iter() {
          log::debug!("  {:#x} : {}", node.addr(), node.size());
        }
      }

      if !collector.is_done() {
        self.check_blocks(verbose, &mut collector, &mut report);
      }
    }

    report.violations = collector.violations;
    if verbose {
      log::debug!("{report}");
    }
    report
  }

  unsafe fn check_blocks(
    &self,
    verbose: bool,
    collector: &mut Collector,
    report: &mut CheckReport,
  ) {
    unsafe {
      let end = self.epilogue();
      let mut cursor = self.first_block();

      while cursor < end && !collector.is_done() {
        let tag = cursor.tag();
        let size = tag.size();
        report.blocks += 1;

        if verbose {
          log::debug!(
            "  block {:#x}: {size} bytes, {}",
            cursor.addr(),
            if tag.is_free() { "free" } else { "allocated" }
          );
        }

        if size == 0 || size > end.addr() - cursor.addr() {
          collector.report(Violation::Overrun {
            block: cursor.addr(),
            size,
          });
          return;
        }

        let next = cursor.next();
        let copy = next.prev_tag();
        if copy != tag {
          collector.report(Violation::BoundaryMismatch {
            block: cursor.addr(),
            own: tag.bits(),
            copy: copy.bits(),
          });
        }

        if tag.is_free() {
          report.free_blocks += 1;

          if cursor.prev_tag().is_free() {
            collector.report(Violation::AdjacentFree {
              first: cursor.prev().addr(),
              second: cursor.addr(),
            });
          }
          if size >= MIN_BLOCK_SIZE && !self.tree().find_exact(cursor) {
            collector.report(Violation::Untracked {
              block: cursor.addr(),
              size,
            });
          }
        }

        cursor = next;
      }
    }
  }
}

/// Collects every red-black or ordering defect of `tree`.
///
/// # Safety
///
/// See [`FreeTree`].
#[cfg(test)]
pub(crate) unsafe fn tree_violations(tree: &FreeTree) -> Vec<Violation> {
  let mut collector = Collector::new(false);
  unsafe { check_tree(tree, &mut collector) };
  collector.violations
}

unsafe fn check_tree(
  tree: &FreeTree,
  collector: &mut Collector,
) {
  unsafe {
    let Some(root) = tree.root() else {
      return;
    };

    if root.is_red() {
      collector.report(Violation::RedRoot { root: root.addr() });
    }
    black_height(tree, root, collector);

    let mut nodes = tree.iter().peekable();
    while let Some(node) = nodes.next() {
      if collector.is_done() {
        return;
      }
      if let Some(&next) = nodes.peek()
        && next.order_key() <= node.order_key()
      {
        collector.report(Violation::OutOfOrder {
          node: node.addr(),
          next: next.addr(),
        });
      }
    }
  }
}

/// Black height of the subtree under `node`, sentinel leaves counted.
/// Reports defects on the way.
unsafe fn black_height(
  tree: &FreeTree,
  node: Block,
  collector: &mut Collector,
) -> usize {
  let nil = tree.sentinel();
  if node == nil {
    return 1;
  }

  unsafe {
    let tag = node.tag();
    if !tag.is_free() {
      collector.report(Violation::AllocatedInTree { block: node.addr() });
    }
    if tag.size() < MIN_BLOCK_SIZE {
      collector.report(Violation::UndersizedNode {
        block: node.addr(),
        size: tag.size(),
      });
      // the links of an undersized node overlap its neighbor
      return 1;
    }

    let mut heights = [0; 2];
    for (height, child) in heights.iter_mut().zip([node.left(), node.right()]) {
      if child == nil {
        *height = 1;
        continue;
      }
      if child.parent() != node {
        collector.report(Violation::BrokenLink {
          parent: node.addr(),
          child: child.addr(),
        });
      }
      if node.is_red() && child.is_red() {
        collector.report(Violation::RedRed {
          parent: node.addr(),
          child: child.addr(),
        });
      }
      *height = black_height(tree, child, collector);
    }

    let [left, right] = heights;
    if left != right {
      collector.report(Violation::BlackHeight {
        node: node.addr(),
        left,
        right,
      });
    }

    left.max(right) + usize::from(!node.is_red())
  }
}
