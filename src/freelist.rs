//! Segregated free lists.
//!
//! Each size class is an intrusive, circular, doubly linked list threaded
//! through the payload of its free blocks:
//!
//! ```text
//!        head
//!         |
//!         v
//!   +--> [A] <--> [B] <--> [C] <--+
//!   |                             |
//!   +-----------------------------+
//! ```
//!
//! The head's `prev` is the tail, so tail insertion and removal by handle are
//! both O(1) with no traversal.

use crate::{MIN_BLOCK_SIZE, NUM_CLASSES, arena::Arena, block::Block};

const MIN_BLOCK_SHIFT: usize = MIN_BLOCK_SIZE.trailing_zeros() as usize;

/// Size class of a block of `size` bytes: class `k` holds sizes in
/// `[MIN_BLOCK_SIZE << k, MIN_BLOCK_SIZE << (k + 1))`, the last class holds
/// everything above.
#[inline]
pub(crate) fn class_of(size: usize) -> usize {
  let log2 = (usize::BITS - 1 - size.max(1).leading_zeros()) as usize;
  log2.saturating_sub(MIN_BLOCK_SHIFT).min(NUM_CLASSES - 1)
}

#[derive(Clone, Copy, Default)]
pub(crate) struct FreeList {
  head: Option<Block>,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self { head: None }
  }

  #[inline]
  pub(crate) fn head(&self) -> Option<Block> {
    self.head
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// Links `block` in at the tail. An empty list becomes a single node
  /// pointing at itself.
  pub(crate) fn push_back(&mut self, arena: &Arena, block: Block) {
    match self.head {
      None => {
        block.set_link_prev(arena, block);
        block.set_link_next(arena, block);
        self.head = Some(block);
      }
      Some(head) => {
        let tail = head.link_prev(arena);
        block.set_link_next(arena, head);
        block.set_link_prev(arena, tail);
        tail.set_link_next(arena, block);
        head.set_link_prev(arena, block);
      }
    }
  }

  /// Unlinks `block`, which must be on this list.
  pub(crate) fn remove(&mut self, arena: &Arena, block: Block) {
    let next = block.link_next(arena);
    if next == block {
      debug_assert_eq!(self.head, Some(block));
      self.head = None;
      return;
    }
    let prev = block.link_prev(arena);
    next.set_link_prev(arena, prev);
    prev.set_link_next(arena, next);
    if self.head == Some(block) {
      self.head = Some(next);
    }
  }

  /// Walks the list once, head first.
  pub(crate) fn iter<'a>(&self, arena: &'a Arena) -> Iter<'a> {
    Iter {
      arena,
      head: self.head,
      current: self.head,
    }
  }
}

pub(crate) struct Iter<'a> {
  arena: &'a Arena,
  head: Option<Block>,
  current: Option<Block>,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    let next = block.link_next(self.arena);
    self.current = if Some(next) == self.head {
      None
    } else {
      Some(next)
    };
    Some(block)
  }
}

/// One [`FreeList`] per size class.
#[derive(Clone, Copy)]
pub(crate) struct SegregatedLists {
  lists: [FreeList; NUM_CLASSES],
}

impl SegregatedLists {
  pub(crate) const fn new() -> Self {
    Self {
      lists: [FreeList::new(); NUM_CLASSES],
    }
  }

  #[inline]
  pub(crate) fn class(&self, index: usize) -> &FreeList {
    &self.lists[index]
  }

  /// Files a free block (size already written) under its class.
  #[inline]
  pub(crate) fn insert(&mut self, arena: &Arena, block: Block) {
    let class = class_of(block.size(arena));
    self.lists[class].push_back(arena, block);
  }

  /// Unlinks a free block. Its size must not have been rewritten since it
  /// was inserted, because that is how its class is found.
  #[inline]
  pub(crate) fn remove(&mut self, arena: &Arena, block: Block) {
    let class = class_of(block.size(arena));
    self.lists[class].remove(arena, block);
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.lists.iter().all(FreeList::is_empty)
  }
}
