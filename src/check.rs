//! Consistency checker. Walks a heap region block by block and every free
//! list node by node; far too slow for the allocation path.

use std::collections::HashSet;

use crate::{
  DSIZE, MIN_BLOCK_SIZE, NUM_CLASSES, PAGE_CLASSES, WSIZE,
  arena::Arena,
  block::{Block, pack, tag_allocated, tag_page, tag_size},
  error::HeapError,
  freelist::class_of,
  heap::Heap,
  page::PageAllocator,
};

/// Checks one heap:
///
/// - every block in the region has a sane size and `header == footer`
/// - no two free blocks are adjacent
/// - a block is free exactly when it is on a list
/// - every listed block is on the list of its own class, with consistent links
/// - no two listed blocks overlap
/// - the region ends in an epilogue
///
/// Listed blocks outside the region (overflow blocks) are checked as nodes
/// only.
pub(crate) fn check_heap(arena: &Arena, heap: &Heap) -> Result<(), HeapError> {
  let listed = check_lists(arena, heap)?;
  if heap.end() > heap.start() {
    check_region(arena, heap, &listed)?;
  }
  Ok(())
}

fn in_bounds(arena: &Arena, block: Block) -> bool {
  let offset = block.offset();
  offset % DSIZE == 0 && offset >= DSIZE && offset + WSIZE <= arena.len()
}

fn check_lists(arena: &Arena, heap: &Heap) -> Result<HashSet<usize>, HeapError> {
  let limit = arena.len() / MIN_BLOCK_SIZE + 1;
  let mut listed = HashSet::new();
  let mut spans = Vec::new();

  for class in 0..NUM_CLASSES {
    let Some(head) = heap.lists.class(class).head() else {
      continue;
    };
    let mut block = head;
    for _ in 0..=limit {
      let offset = block.offset();
      if !in_bounds(arena, block) {
        return Err(HeapError::BrokenLink { class, offset });
      }
      let size = block.size(arena);
      if size < MIN_BLOCK_SIZE || offset - WSIZE + size > arena.len() {
        return Err(HeapError::BadSize { offset, size });
      }
      check_tags(arena, block)?;
      if block.is_allocated(arena) {
        return Err(HeapError::AllocatedListed { offset });
      }
      let expected = class_of(size);
      if expected != class {
        return Err(HeapError::WrongClass {
          offset,
          class,
          expected,
        });
      }
      if !listed.insert(offset) {
        return Err(HeapError::BrokenLink { class, offset });
      }
      spans.push((offset, size));

      let next = block.link_next(arena);
      if !in_bounds(arena, next) || next.link_prev(arena) != block {
        return Err(HeapError::BrokenLink { class, offset });
      }
      if next == head {
        break;
      }
      block = next;
    }
    if block.link_next(arena) != head {
      return Err(HeapError::BrokenLink {
        class,
        offset: block.offset(),
      });
    }
  }

  spans.sort_unstable();
  for pair in spans.windows(2) {
    let (first, size) = pair[0];
    let (second, _) = pair[1];
    if first + size > second {
      return Err(HeapError::Overlap { first, second });
    }
  }
  Ok(listed)
}

fn check_tags(arena: &Arena, block: Block) -> Result<(), HeapError> {
  let header = block.tag(arena);
  let footer = arena.load(block.footer(arena));
  if header != footer {
    return Err(HeapError::HeaderFooterMismatch {
      offset: block.offset(),
      header,
      footer,
    });
  }
  Ok(())
}

fn check_region(arena: &Arena, heap: &Heap, listed: &HashSet<usize>) -> Result<(), HeapError> {
  let end = heap.end();
  let mut block = heap.first_block();
  let mut prev_free: Option<usize> = None;

  while block.offset() < end {
    let offset = block.offset();
    let tag = block.tag(arena);
    let size = tag_size(tag);
    if size == 0 {
      break;
    }
    if size < MIN_BLOCK_SIZE || offset - WSIZE + size > end - WSIZE || tag_page(tag) {
      return Err(HeapError::BadSize { offset, size });
    }
    check_tags(arena, block)?;

    if tag_allocated(tag) {
      prev_free = None;
    } else {
      if let Some(prev) = prev_free {
        return Err(HeapError::Uncoalesced { offset: prev });
      }
      if !listed.contains(&offset) {
        return Err(HeapError::Unlisted { offset });
      }
      prev_free = Some(offset);
    }
    block = block.next(arena);
  }

  if block.offset() != end || arena.load(end - WSIZE) != pack(0, true) {
    return Err(HeapError::BadEpilogue {
      offset: block.offset(),
    });
  }
  Ok(())
}

/// Checks that every free page chunk is tagged free, is a whole number of
/// pages and sits in the class for its page count.
pub(crate) fn check_pages(arena: &Arena, pages: &PageAllocator) -> Result<(), HeapError> {
  let page = arena.page_size();
  for class in 0..PAGE_CLASSES {
    for chunk in pages.free_chunks(arena, class) {
      let tag = arena.load(chunk + WSIZE);
      let size = tag_size(tag);
      let sane = tag_page(tag)
        && !tag_allocated(tag)
        && size > 0
        && size % page == 0
        && PageAllocator::class_of(size / page) == class;
      if !sane {
        return Err(HeapError::BadPageBlock {
          offset: chunk + DSIZE,
        });
      }
    }
  }
  Ok(())
}
