//! Page-granularity allocator for large requests.
//!
//! Chunks are whole multiples of the page size and carry a single header
//! word with the page bit set:
//!
//! ```text
//!   | pad | header | payload ........................................ |
//!   ^ chunk       ^ payload = chunk + DSIZE
//! ```
//!
//! Class `k < PAGE_CLASSES - 1` holds free chunks of exactly `k + 1` pages;
//! the last class holds everything larger. Each class is a singly linked LIFO
//! with its own lock, so large requests of different sizes do not contend.
//! Chunks are split in page units but never merged back.

use crate::{
  DSIZE, PAGE_CLASSES, WSIZE,
  arena::Arena,
  block::{pack_page, tag_allocated, tag_page, tag_size},
  sync::SpinMutex,
};

const NIL: usize = usize::MAX;

#[inline]
fn class_of(pages: usize) -> usize {
  pages.clamp(1, PAGE_CLASSES) - 1
}

struct PageList {
  head: usize,
}

impl PageList {
  const fn new() -> Self {
    Self { head: NIL }
  }

  fn push(&mut self, arena: &Arena, chunk: usize) {
    arena.store(chunk + DSIZE, self.head);
    self.head = chunk;
  }

  fn pop(&mut self, arena: &Arena) -> Option<usize> {
    if self.head == NIL {
      return None;
    }
    let chunk = self.head;
    self.head = arena.load(chunk + DSIZE);
    Some(chunk)
  }

  /// Unlinks the first chunk of at least `bytes`.
  fn take_fit(&mut self, arena: &Arena, bytes: usize) -> Option<usize> {
    let mut prev = NIL;
    let mut cur = self.head;
    while cur != NIL {
      let next = arena.load(cur + DSIZE);
      if chunk_size(arena, cur) >= bytes {
        if prev == NIL {
          self.head = next;
        } else {
          arena.store(prev + DSIZE, next);
        }
        return Some(cur);
      }
      prev = cur;
      cur = next;
    }
    None
  }
}

#[inline]
fn chunk_size(arena: &Arena, chunk: usize) -> usize {
  tag_size(arena.load(chunk + WSIZE))
}

#[inline]
fn write_header(arena: &Arena, chunk: usize, size: usize, allocated: bool) {
  arena.store(chunk, 0);
  arena.store(chunk + WSIZE, pack_page(size, allocated));
}

pub(crate) struct PageAllocator {
  classes: [SpinMutex<PageList>; PAGE_CLASSES],
}

impl PageAllocator {
  pub(crate) const fn new() -> Self {
    Self {
      classes: [const { SpinMutex::new(PageList::new()) }; PAGE_CLASSES],
    }
  }

  /// Pages needed for a payload of `size` bytes.
  #[inline]
  pub(crate) fn pages_for(arena: &Arena, size: usize) -> Option<usize> {
    Some(size.checked_add(DSIZE)?.div_ceil(arena.page_size()))
  }

  /// Returns the payload offset of an allocated chunk with room for `size`
  /// bytes. Reuses a free chunk when one is large enough, splitting off
  /// whole pages, and grows the arena otherwise.
  pub(crate) fn allocate(&self, arena: &Arena, size: usize) -> Option<usize> {
    let page = arena.page_size();
    let pages = Self::pages_for(arena, size)?;
    let bytes = pages.checked_mul(page)?;

    let chunk = match self.find(arena, pages, bytes) {
      Some(chunk) => {
        let have = chunk_size(arena, chunk);
        if have > bytes {
          let rest = chunk + bytes;
          write_header(arena, rest, have - bytes, false);
          self.classes[class_of((have - bytes) / page)]
            .lock()
            .push(arena, rest);
        }
        chunk
      }
      None => {
        let chunk = arena.grow(bytes).ok()?;
        log::trace!("page: carved {pages} pages at {chunk:#x}");
        chunk
      }
    };
    write_header(arena, chunk, bytes, true);
    Some(chunk + DSIZE)
  }

  fn find(&self, arena: &Arena, pages: usize, bytes: usize) -> Option<usize> {
    let first = class_of(pages);
    if first < PAGE_CLASSES - 1
      && let Some(chunk) = self.classes[first].lock().pop(arena)
    {
      return Some(chunk);
    }
    (first..PAGE_CLASSES).find_map(|class| self.classes[class].lock().take_fit(arena, bytes))
  }

  /// Returns the chunk at `payload` to its class.
  pub(crate) fn free(&self, arena: &Arena, payload: usize) {
    let chunk = payload - DSIZE;
    let size = chunk_size(arena, chunk);
    debug_assert!(tag_allocated(arena.load(chunk + WSIZE)));
    write_header(arena, chunk, size, false);
    self.classes[class_of(size / arena.page_size())]
      .lock()
      .push(arena, chunk);
  }

  /// Payload bytes of the chunk at `payload`.
  #[inline]
  pub(crate) fn usable(arena: &Arena, payload: usize) -> usize {
    chunk_size(arena, payload - DSIZE) - DSIZE
  }

  /// Like [`usable`](Self::usable), but only for a live chunk header at
  /// `payload` whose chunk lies inside the arena.
  pub(crate) fn checked_usable(arena: &Arena, payload: usize) -> Option<usize> {
    let chunk = payload.checked_sub(DSIZE)?;
    let tag = arena.load(chunk + WSIZE);
    let size = tag_size(tag);
    let page = arena.page_size();
    if !tag_page(tag) || !tag_allocated(tag) || size < page || size % page != 0 {
      return None;
    }
    (chunk.checked_add(size)? <= arena.len()).then_some(size - DSIZE)
  }

  /// Whether the word before `payload` is a page chunk header.
  #[inline]
  pub(crate) fn is_page(arena: &Arena, payload: usize) -> bool {
    tag_page(arena.load(payload - WSIZE))
  }

  /// Free chunk offsets of one class, head first.
  #[cfg(feature = "heap-check")]
  pub(crate) fn free_chunks(&self, arena: &Arena, class: usize) -> Vec<usize> {
    let list = self.classes[class].lock();
    let mut chunks = Vec::new();
    let mut cur = list.head;
    while cur != NIL {
      chunks.push(cur);
      cur = arena.load(cur + DSIZE);
    }
    chunks
  }

  #[cfg(feature = "heap-check")]
  pub(crate) fn class_of(pages: usize) -> usize {
    class_of(pages)
  }
}
