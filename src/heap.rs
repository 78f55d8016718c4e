//! A contiguous run of blocks framed by sentinels, plus its free lists.
//!
//! ```text
//!   start                                                       end
//!   | pad | prologue hdr | prologue ftr | block | ... | block | epilogue hdr |
//! ```
//!
//! The prologue is a minimal allocated block and the epilogue an allocated
//! header of size zero, so neighbor lookups from any real block always land
//! on a valid tag and never leave the region.

use crate::{
  DSIZE, MIN_BLOCK_SIZE, SMALL_ROUND_LIMIT, WSIZE,
  arena::Arena,
  block::{Block, pack, tag_allocated},
  error::OutOfMemory,
  freelist::SegregatedLists,
};

/// Bytes of framing a region needs: padding word, prologue, epilogue.
pub(crate) const FRAME_SIZE: usize = 4 * WSIZE;

/// Block size for a payload of `size` bytes: header and footer added, then
/// rounded up to `DSIZE`, never below [`MIN_BLOCK_SIZE`].
#[inline]
pub(crate) fn block_size(size: usize) -> Option<usize> {
  if size <= DSIZE {
    return Some(MIN_BLOCK_SIZE);
  }
  let padded = size.checked_add(2 * DSIZE - 1)?;
  Some(padded / DSIZE * DSIZE)
}

/// [`block_size`] for fresh allocations: small requests are first rounded up
/// to a power of two so they land in fewer, busier classes.
#[inline]
pub(crate) fn malloc_block_size(size: usize) -> Option<usize> {
  if size < SMALL_ROUND_LIMIT {
    block_size(size.next_power_of_two())
  } else {
    block_size(size)
  }
}

pub(crate) struct Heap {
  pub(crate) lists: SegregatedLists,
  start: usize,
  end: usize,
}

impl Heap {
  /// A heap with no region. It still owns lists, which can hold blocks that
  /// live outside any region.
  pub(crate) const fn empty() -> Self {
    Self {
      lists: SegregatedLists::new(),
      start: 0,
      end: 0,
    }
  }

  /// Frames `[start, start + len)` and files whatever lies between the
  /// sentinels as one free block.
  pub(crate) fn format(arena: &Arena, start: usize, len: usize) -> Self {
    debug_assert!(start % DSIZE == 0 && len % DSIZE == 0);
    debug_assert!(len == FRAME_SIZE || len >= FRAME_SIZE + MIN_BLOCK_SIZE);

    arena.store(start, 0);
    arena.store(start + WSIZE, pack(DSIZE, true));
    arena.store(start + 2 * WSIZE, pack(DSIZE, true));
    let end = start + len;
    arena.store(end - WSIZE, pack(0, true));

    let mut heap = Self {
      lists: SegregatedLists::new(),
      start,
      end,
    };
    if len > FRAME_SIZE {
      let block = heap.first_block();
      block.write(arena, len - FRAME_SIZE, false);
      heap.lists.insert(arena, block);
    }
    log::debug!("heap: formatted [{start:#x}, {end:#x})");
    heap
  }

  #[inline]
  pub(crate) fn start(&self) -> usize {
    self.start
  }

  #[inline]
  pub(crate) fn end(&self) -> usize {
    self.end
  }

  #[inline]
  pub(crate) fn contains(&self, offset: usize) -> bool {
    offset >= self.start && offset < self.end
  }

  #[inline]
  pub(crate) fn first_block(&self) -> Block {
    Block::at(self.start + 2 * DSIZE)
  }

  /// Grows the region in place by `size` bytes. The new block takes over the
  /// old epilogue as its header and comes back allocated, on no list.
  ///
  /// Fails, leaving the region as it was, if the arena's break is no longer
  /// the end of the region.
  pub(crate) fn extend(&mut self, arena: &Arena, size: usize) -> Result<Block, OutOfMemory> {
    if arena.len() != self.end {
      log::warn!("heap: region ends at {:#x} but the break is at {:#x}", self.end, arena.len());
      return Err(OutOfMemory {
        requested: size,
        available: 0,
      });
    }
    let offset = arena.grow(size)?;
    if offset != self.end {
      log::warn!("heap: lost the break to another grower at {offset:#x}");
      return Err(OutOfMemory {
        requested: size,
        available: 0,
      });
    }

    let block = Block::at(self.end);
    block.write(arena, size, true);
    self.end += size;
    arena.store(self.end - WSIZE, pack(0, true));
    Ok(block)
  }

  /// First fit for `asize`, marked allocated.
  #[inline]
  pub(crate) fn take(&mut self, arena: &Arena, asize: usize) -> Option<Block> {
    let block = self.find_fit(arena, asize)?;
    block.set_allocated(arena, true);
    Some(block)
  }

  /// Frees `block`, merges it with free neighbors and files the result.
  pub(crate) fn release(&mut self, arena: &Arena, block: Block) {
    block.set_allocated(arena, false);
    let merged = self.coalesce(arena, block);
    self.lists.insert(arena, merged);
  }

  /// Frees `block` without looking at its neighbors.
  pub(crate) fn release_detached(&mut self, arena: &Arena, block: Block) {
    block.set_allocated(arena, false);
    self.lists.insert(arena, block);
  }

  /// Cuts an allocated block down to `asize`. The tail goes back on a list
  /// when it is big enough to be a block; with `merge_tail` it is first
  /// merged with a free successor.
  pub(crate) fn shrink(&mut self, arena: &Arena, block: Block, asize: usize, merge_tail: bool) {
    let Some(mut rest) = self.split_off(arena, block, asize) else {
      return;
    };
    if merge_tail {
      rest = self.coalesce(arena, rest);
    }
    self.lists.insert(arena, rest);
  }

  /// Grows an allocated block to at least `asize` using its free neighbors.
  /// The payload moves with the block start. Returns `None`, with nothing
  /// touched, when the neighbors together are still too small.
  pub(crate) fn grow_in_place(&mut self, arena: &Arena, block: Block, asize: usize) -> Option<Block> {
    let old_size = block.size(arena);
    let next = block.next(arena);
    let mut room = old_size;
    if !next.is_allocated(arena) {
      room += next.size(arena);
    }
    if !tag_allocated(block.prev_tag(arena)) {
      room += block.prev(arena).size(arena);
    }
    if room < asize {
      return None;
    }

    block.set_allocated(arena, false);
    let merged = self.coalesce(arena, block);
    if merged != block {
      arena.copy(block.offset(), merged.offset(), old_size - DSIZE);
    }
    if let Some(rest) = self.split_off(arena, merged, asize) {
      self.lists.insert(arena, rest);
    }
    merged.set_allocated(arena, true);
    Some(merged)
  }

  /// Walks every block between the sentinels.
  #[cfg(test)]
  pub(crate) fn blocks<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = Block> + 'a {
    let end = self.end;
    let mut current = (self.end > self.start).then(|| self.first_block());
    core::iter::from_fn(move || {
      let block = current?;
      let size = block.size(arena);
      if size == 0 || block.offset() >= end {
        current = None;
        return None;
      }
      current = Some(block.next(arena));
      Some(block)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn region(len: usize) -> (Arena, Heap) {
    let arena = Arena::new(1 << 20).unwrap();
    let start = arena.grow(len).unwrap();
    let heap = Heap::format(&arena, start, len);
    (arena, heap)
  }

  #[test]
  fn size_policy() {
    assert_eq!(block_size(1), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size(DSIZE), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size(DSIZE + 1), Some(3 * DSIZE));
    assert_eq!(block_size(40), Some(64));
    assert_eq!(block_size(usize::MAX), None);

    // 100 rounds to 128 before overhead; 600 is past the rounding limit.
    assert_eq!(malloc_block_size(100), Some(144));
    assert_eq!(malloc_block_size(600), Some(624));
    assert_eq!(malloc_block_size(8), Some(MIN_BLOCK_SIZE));
  }

  #[test]
  fn format_frames_one_free_block() {
    let (arena, heap) = region(1024);
    let first = heap.first_block();
    assert_eq!(first.size(&arena), 1024 - FRAME_SIZE);
    assert!(!first.is_allocated(&arena));
    assert_eq!(heap.blocks(&arena).collect::<Vec<_>>(), vec![first]);
    assert!(heap.contains(first.offset()));
    assert!(!heap.contains(heap.end()));
  }

  #[test]
  fn bare_frame_has_no_blocks() {
    let (arena, heap) = region(FRAME_SIZE);
    assert!(heap.lists.is_empty());
    assert_eq!(heap.blocks(&arena).count(), 0);
  }

  #[test]
  fn extend_reuses_epilogue_as_header() {
    let (arena, mut heap) = region(FRAME_SIZE);
    let a = heap.extend(&arena, 64).unwrap();
    assert_eq!(a.header(), heap.start() + FRAME_SIZE - WSIZE);
    let b = heap.extend(&arena, 32).unwrap();
    assert_eq!(a.next(&arena), b);
    assert_eq!(heap.blocks(&arena).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(arena.load(heap.end() - WSIZE), pack(0, true));
  }

  #[test]
  fn extend_refuses_a_moved_break() {
    let (arena, mut heap) = region(FRAME_SIZE);
    let end = heap.end();
    arena.grow(64).unwrap();
    assert!(heap.extend(&arena, 64).is_err());
    assert_eq!(heap.end(), end);
    assert_eq!(arena.len(), end + 64);
    assert_eq!(arena.load(end - WSIZE), pack(0, true));
  }

  #[test]
  fn shrink_merges_tail_with_free_successor() {
    let (arena, mut heap) = region(FRAME_SIZE + 256);
    let a = heap.take(&arena, 128).unwrap();
    // 128 bytes of free space follow `a`.
    heap.shrink(&arena, a, 64, true);
    assert_eq!(a.size(&arena), 64);
    let rest = a.next(&arena);
    assert_eq!(rest.size(&arena), 192);
    assert_eq!(heap.blocks(&arena).count(), 2);
  }

  #[test]
  fn grow_in_place_moves_payload_down() {
    let (arena, mut heap) = region(FRAME_SIZE + 256);
    let a = heap.take(&arena, 64).unwrap();
    let b = heap.take(&arena, 64).unwrap();
    let _c = heap.take(&arena, 128).unwrap();
    arena.store(b.offset(), 0x1234);
    arena.store(b.offset() + WSIZE, 0x5678);
    heap.release(&arena, a);

    let grown = heap.grow_in_place(&arena, b, 128).unwrap();
    assert_eq!(grown, a);
    assert!(grown.is_allocated(&arena));
    assert_eq!(arena.load(grown.offset()), 0x1234);
    assert_eq!(arena.load(grown.offset() + WSIZE), 0x5678);
  }

  #[test]
  fn grow_in_place_refuses_without_touching() {
    let (arena, mut heap) = region(FRAME_SIZE + 128);
    let a = heap.take(&arena, 64).unwrap();
    let _b = heap.take(&arena, 64).unwrap();
    assert!(heap.grow_in_place(&arena, a, 128).is_none());
    assert!(a.is_allocated(&arena));
    assert_eq!(a.size(&arena), 64);
  }
}
