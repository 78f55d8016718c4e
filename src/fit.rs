//! First fit over the segregated classes, and block splitting.

use crate::{
  MIN_BLOCK_SIZE, NUM_CLASSES,
  arena::Arena,
  block::Block,
  freelist::class_of,
  heap::Heap,
};

impl Heap {
  /// Takes the first free block of at least `asize` bytes off its list,
  /// scanning upward from the class of `asize`. Smaller classes are never
  /// looked at since nothing in them can fit.
  ///
  /// A remainder of at least [`MIN_BLOCK_SIZE`] is split off and filed at the
  /// tail of its class, so later scans reach it last. The returned block is
  /// still tagged free.
  pub(crate) fn find_fit(&mut self, arena: &Arena, asize: usize) -> Option<Block> {
    for class in class_of(asize)..NUM_CLASSES {
      let found = self
        .lists
        .class(class)
        .iter(arena)
        .find(|block| block.size(arena) >= asize);

      if let Some(block) = found {
        self.lists.remove(arena, block);
        if let Some(rest) = self.split_off(arena, block, asize) {
          self.lists.insert(arena, rest);
        }
        return Some(block);
      }
    }
    None
  }

  /// Cuts `block` down to `asize` bytes and returns the free tail, or leaves
  /// the block whole if the tail would be smaller than a minimum block. The
  /// block keeps its allocated flag; the tail is on no list.
  pub(crate) fn split_off(&self, arena: &Arena, block: Block, asize: usize) -> Option<Block> {
    let size = block.size(arena);
    debug_assert!(size >= asize);
    let remainder = size - asize;
    if remainder < MIN_BLOCK_SIZE {
      return None;
    }

    block.write(arena, asize, block.is_allocated(arena));
    let rest = Block::at(block.offset() + asize);
    rest.write(arena, remainder, false);
    Some(rest)
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    MIN_BLOCK_SIZE,
    arena::Arena,
    heap::{FRAME_SIZE, Heap},
  };

  fn region(len: usize) -> (Arena, Heap) {
    let arena = Arena::new(1 << 20).unwrap();
    let start = arena.grow(len).unwrap();
    let heap = Heap::format(&arena, start, len);
    (arena, heap)
  }

  #[test]
  fn splits_large_remainder() {
    let (arena, mut heap) = region(FRAME_SIZE + 512);
    let block = heap.find_fit(&arena, 64).unwrap();
    assert_eq!(block.size(&arena), 64);
    assert!(!block.is_allocated(&arena));
    let rest = block.next(&arena);
    assert_eq!(rest.size(&arena), 448);
    assert_eq!(heap.lists.class(crate::freelist::class_of(448)).head(), Some(rest));
  }

  #[test]
  fn keeps_sliver_inside_block() {
    let (arena, mut heap) = region(FRAME_SIZE + 80);
    let block = heap.find_fit(&arena, 64).unwrap();
    assert_eq!(block.size(&arena), 80);
    assert!(heap.lists.is_empty());
  }

  #[test]
  fn misses_when_nothing_fits() {
    let (arena, mut heap) = region(FRAME_SIZE + 64);
    assert!(heap.find_fit(&arena, 128).is_none());
    assert!(!heap.lists.is_empty());
  }

  #[test]
  fn first_fit_within_class() {
    // Three free blocks of 96, 80, 112 bytes, separated by allocated ones.
    let (arena, mut heap) = region(FRAME_SIZE + 96 + 32 + 80 + 32 + 112);
    let a = heap.take(&arena, 96).unwrap();
    let _s1 = heap.take(&arena, MIN_BLOCK_SIZE).unwrap();
    let b = heap.take(&arena, 80).unwrap();
    let _s2 = heap.take(&arena, MIN_BLOCK_SIZE).unwrap();
    let c = heap.take(&arena, 112).unwrap();
    heap.release(&arena, b);
    heap.release(&arena, a);
    heap.release(&arena, c);

    // List order is b, a, c; 80 only fits b and the next request fits a first.
    assert_eq!(heap.find_fit(&arena, 80), Some(b));
    assert_eq!(heap.find_fit(&arena, 96), Some(a));
  }

  #[test]
  fn scans_upward_past_empty_classes() {
    let (arena, mut heap) = region(FRAME_SIZE + 4096);
    let block = heap.find_fit(&arena, MIN_BLOCK_SIZE).unwrap();
    assert_eq!(block.size(&arena), MIN_BLOCK_SIZE);
  }
}
