use crate::{
  arena::Arena,
  block::{Block, tag_allocated},
  heap::Heap,
};

impl Heap {
  /// Merges a free-tagged block with whichever immediate neighbors are free.
  ///
  /// Merged neighbors come off their lists. The result keeps the lowest
  /// address of the merged span and is on no list, so the caller decides
  /// what to do with it before filing it.
  pub(crate) fn coalesce(&mut self, arena: &Arena, block: Block) -> Block {
    let prev_free = !tag_allocated(block.prev_tag(arena));
    let next = block.next(arena);
    let next_free = !next.is_allocated(arena);
    let mut size = block.size(arena);

    match (prev_free, next_free) {
      (false, false) => block,
      (false, true) => {
        self.lists.remove(arena, next);
        size += next.size(arena);
        block.write(arena, size, false);
        block
      }
      (true, false) => {
        let prev = block.prev(arena);
        self.lists.remove(arena, prev);
        size += prev.size(arena);
        prev.write(arena, size, false);
        prev
      }
      (true, true) => {
        let prev = block.prev(arena);
        self.lists.remove(arena, prev);
        self.lists.remove(arena, next);
        size += prev.size(arena) + next.size(arena);
        prev.write(arena, size, false);
        prev
      }
    }
  }
}
