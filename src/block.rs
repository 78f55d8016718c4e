//! In-band block metadata.
//!
//! ```text
//!   allocated:  | header | payload ............ (padding) | footer |
//!   free:       | header | prev | next | ........         | footer |
//!                        ^
//!                        Block (payload offset)
//! ```
//!
//! Header and footer hold the same tag word: the block size (a multiple of
//! `DSIZE`, header and footer included) OR'd with flag bits in the low bits
//! the alignment leaves free.

use crate::{DSIZE, MIN_BLOCK_SIZE, WSIZE, arena::Arena};

const ALLOCATED: usize = 0b01;
/// Marks a chunk owned by the page allocator.
const PAGE: usize = 0b10;
const FLAGS: usize = DSIZE - 1;

const _: () = assert!(PAGE | ALLOCATED <= FLAGS);

#[inline(always)]
pub(crate) const fn pack(size: usize, allocated: bool) -> usize {
  debug_assert!(size & FLAGS == 0);
  size | allocated as usize
}

#[inline(always)]
pub(crate) const fn pack_page(size: usize, allocated: bool) -> usize {
  pack(size, allocated) | PAGE
}

#[inline(always)]
pub(crate) const fn tag_size(tag: usize) -> usize {
  tag & !FLAGS
}

#[inline(always)]
pub(crate) const fn tag_allocated(tag: usize) -> bool {
  tag & ALLOCATED != 0
}

#[inline(always)]
pub(crate) const fn tag_page(tag: usize) -> bool {
  tag & PAGE != 0
}

/// Handle to a block: the arena offset of its payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct Block(usize);

impl Block {
  #[inline(always)]
  pub(crate) const fn at(payload: usize) -> Self {
    debug_assert!(payload % DSIZE == 0);
    Self(payload)
  }

  #[inline(always)]
  pub(crate) const fn offset(self) -> usize {
    self.0
  }

  #[inline(always)]
  pub(crate) const fn header(self) -> usize {
    self.0 - WSIZE
  }

  #[inline(always)]
  pub(crate) fn footer(self, arena: &Arena) -> usize {
    self.0 + self.size(arena) - DSIZE
  }

  #[inline(always)]
  pub(crate) fn tag(self, arena: &Arena) -> usize {
    arena.load(self.header())
  }

  #[inline(always)]
  pub(crate) fn size(self, arena: &Arena) -> usize {
    tag_size(self.tag(arena))
  }

  #[inline(always)]
  pub(crate) fn is_allocated(self, arena: &Arena) -> bool {
    tag_allocated(self.tag(arena))
  }

  /// Rewrites header and footer. The footer position follows from `size`.
  #[inline]
  pub(crate) fn write(self, arena: &Arena, size: usize, allocated: bool) {
    let tag = pack(size, allocated);
    arena.store(self.header(), tag);
    arena.store(self.0 + size - DSIZE, tag);
  }

  /// Flips the allocated flag in place.
  #[inline]
  pub(crate) fn set_allocated(self, arena: &Arena, allocated: bool) {
    self.write(arena, self.size(arena), allocated);
  }

  /// Bytes the caller may use, if the tags at `self` describe an allocated
  /// block that ends at or before `end`. `None` for anything else, such as a
  /// pointer into the middle of a payload.
  pub(crate) fn checked_usable(self, arena: &Arena, end: usize) -> Option<usize> {
    if self.0 < DSIZE {
      return None;
    }
    let tag = self.tag(arena);
    let size = tag_size(tag);
    if size < MIN_BLOCK_SIZE || !tag_allocated(tag) || tag_page(tag) {
      return None;
    }
    let footer = self.0.checked_add(size)? - DSIZE;
    if footer.checked_add(WSIZE)? > end || arena.load(footer) != tag {
      return None;
    }
    Some(size - DSIZE)
  }

  #[inline]
  pub(crate) fn next(self, arena: &Arena) -> Block {
    Block(self.0 + self.size(arena))
  }

  /// Tag of the physically preceding block, read from its footer.
  #[inline]
  pub(crate) fn prev_tag(self, arena: &Arena) -> usize {
    arena.load(self.0 - DSIZE)
  }

  #[inline]
  pub(crate) fn prev(self, arena: &Arena) -> Block {
    Block(self.0 - tag_size(self.prev_tag(arena)))
  }

  // Free-list links live in the first two payload words.

  #[inline]
  pub(crate) fn link_prev(self, arena: &Arena) -> Block {
    Block(arena.load(self.0))
  }

  #[inline]
  pub(crate) fn link_next(self, arena: &Arena) -> Block {
    Block(arena.load(self.0 + WSIZE))
  }

  #[inline]
  pub(crate) fn set_link_prev(self, arena: &Arena, prev: Block) {
    arena.store(self.0, prev.0);
  }

  #[inline]
  pub(crate) fn set_link_next(self, arena: &Arena, next: Block) {
    arena.store(self.0 + WSIZE, next.0);
  }
}
