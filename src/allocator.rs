//! Single-heap allocators: one region, one set of size classes.
//!
//! [`Allocator`] needs `&mut self` for every call, so the borrow checker does
//! the serializing. [`LockedAllocator`] puts the same state behind one lock
//! and can be shared between threads.

use core::ptr::NonNull;

use crate::{
  DSIZE, MIN_BLOCK_SIZE,
  arena::Arena,
  block::Block,
  error::InitError,
  heap::{FRAME_SIZE, Heap, block_size, malloc_block_size},
  sync::SpinMutex,
};

pub struct Allocator {
  arena: Arena,
  heap: Heap,
}

impl Allocator {
  /// Reserves an arena of `capacity` bytes and frames an empty heap at its
  /// start. Every size class starts out empty.
  pub fn new(capacity: usize) -> Result<Self, InitError> {
    if capacity < FRAME_SIZE + MIN_BLOCK_SIZE {
      return Err(InitError::InvalidConfig("arena capacity too small"));
    }
    let arena = Arena::new(capacity)?;
    let start = arena.grow(FRAME_SIZE)?;
    let heap = Heap::format(&arena, start, FRAME_SIZE);
    Ok(Self { arena, heap })
  }

  /// Returns a `DSIZE`-aligned block of at least `size` bytes, or `None` for
  /// a zero size or an exhausted arena.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let asize = malloc_block_size(size)?;
    let block = match self.heap.take(&self.arena, asize) {
      Some(block) => block,
      None => self.heap.extend(&self.arena, asize).ok()?,
    };
    Some(self.arena.ptr(block.offset()))
  }

  /// Frees a block. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this allocator.
  pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let Some(block) = self.block_of(ptr) else {
      log::warn!("allocator: ignoring free of foreign pointer {ptr:p}");
      return;
    };
    self.heap.release(&self.arena, block);
  }

  /// Resizes a block, keeping the first `min(old, size)` bytes.
  ///
  /// Shrinking and equal sizes return `ptr`. Growing first tries the free
  /// neighbors, then a fit elsewhere, then fresh arena space. On failure the
  /// original block is left as it was.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this allocator. After
  /// a successful call only the returned pointer may be used.
  pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      unsafe { self.deallocate(ptr) };
      return None;
    }
    let Some(current) = NonNull::new(ptr) else {
      return self.allocate(size);
    };
    let Some(block) = self.block_of(ptr) else {
      log::warn!("allocator: ignoring realloc of foreign pointer {ptr:p}");
      return None;
    };

    let asize = block_size(size)?;
    let old_size = block.size(&self.arena);
    if asize == old_size {
      return Some(current);
    }
    if asize < old_size {
      self.heap.shrink(&self.arena, block, asize, true);
      return Some(current);
    }
    if let Some(grown) = self.heap.grow_in_place(&self.arena, block, asize) {
      return Some(self.arena.ptr(grown.offset()));
    }

    let moved = match self.heap.take(&self.arena, asize) {
      Some(moved) => moved,
      None => self.heap.extend(&self.arena, asize).ok()?,
    };
    self.arena.copy(block.offset(), moved.offset(), old_size - DSIZE);
    self.heap.release(&self.arena, block);
    Some(self.arena.ptr(moved.offset()))
  }

  /// Payload bytes available at `ptr`, or 0 for null, foreign and interior
  /// pointers.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    self
      .block_of(ptr)
      .and_then(|block| block.checked_usable(&self.arena, self.heap.end()))
      .unwrap_or(0)
  }

  pub fn arena(&self) -> &Arena {
    &self.arena
  }

  /// Walks the whole heap and every free list.
  #[cfg(feature = "heap-check")]
  pub fn check(&self) -> Result<(), crate::error::HeapError> {
    crate::check::check_heap(&self.arena, &self.heap)
  }

  fn block_of(&self, ptr: *const u8) -> Option<Block> {
    let offset = self.arena.offset_of(ptr)?;
    if offset % DSIZE != 0 || offset < DSIZE || !self.heap.contains(offset) {
      return None;
    }
    Some(Block::at(offset))
  }
}

/// [`Allocator`] behind a single lock. Every call holds the lock for its
/// full duration, including the zero-size and null early returns.
pub struct LockedAllocator {
  inner: SpinMutex<Allocator>,
}

impl LockedAllocator {
  pub fn new(capacity: usize) -> Result<Self, InitError> {
    Ok(Self {
      inner: SpinMutex::new(Allocator::new(capacity)?),
    })
  }

  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    self.inner.lock().allocate(size)
  }

  /// # Safety
  ///
  /// Same contract as [`Allocator::deallocate`].
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    unsafe { self.inner.lock().deallocate(ptr) }
  }

  /// # Safety
  ///
  /// Same contract as [`Allocator::reallocate`].
  pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.inner.lock().reallocate(ptr, size) }
  }

  pub fn usable_size(&self, ptr: *const u8) -> usize {
    self.inner.lock().usable_size(ptr)
  }

  /// Bytes of arena handed out so far.
  pub fn arena_len(&self) -> usize {
    self.inner.lock().arena().len()
  }

  /// Direct access when the caller already has exclusive ownership.
  pub fn get_mut(&mut self) -> &mut Allocator {
    self.inner.get_mut()
  }

  #[cfg(feature = "heap-check")]
  pub fn check(&self) -> Result<(), crate::error::HeapError> {
    self.inner.lock().check()
  }
}
