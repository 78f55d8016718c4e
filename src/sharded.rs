//! Thread-sharded allocator.
//!
//! The arena is cut into fixed-size segments, each a framed [`Heap`] with its
//! own size classes. A thread claims one segment on first use and serves
//! small requests from it without taking any lock. Large requests go to the
//! shared [`PageAllocator`].
//!
//! Freeing a block that lives in another thread's segment pushes it onto that
//! segment's remote-free stack. The block stays tagged allocated, so the
//! owner's coalescing never sees it, until the owner drains the stack on its
//! next allocate or free and releases each block with full coalescing.
//!
//! When a segment runs dry the thread carves a self-contained overflow chunk
//! from the arena instead. Overflow blocks belong to no segment, are never
//! coalesced and, once freed, join the freeing thread's lists.
//!
//! A thread that exits orphans its segment. The next thread to register
//! adopts it, pending remote frees included.

use core::{
  cell::{RefCell, UnsafeCell},
  ptr::{self, NonNull},
  sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::sync::{Arc, Weak};

use crate::{
  DSIZE, WSIZE,
  arena::Arena,
  block::{Block, pack},
  config::Config,
  error::{InitError, OutOfMemory},
  heap::{Heap, block_size, malloc_block_size},
  page::PageAllocator,
  sync::SpinMutex,
};

const OWNER_ORPHAN: u32 = 0;
const NIL: usize = usize::MAX;

// Each thread gets a different ID
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1); // Start at 1; 0 = OWNER_ORPHAN
      CTR.fetch_add(1, Ordering::Relaxed)
    };
  }
  TID.with(|&id| id)
}

// =============================================================================
// Segments
// =============================================================================

struct Segment {
  lo: usize,
  hi: usize,
  owner: AtomicU32,
  heap: UnsafeCell<Heap>,
  /// Treiber stack of payload offsets freed by other threads. The link lives
  /// in the first payload word.
  remote_free: AtomicUsize,
}

// `heap` is only touched by the thread whose id is in `owner`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
  fn carve(arena: &Arena, size: usize, owner: u32) -> Result<Box<Self>, OutOfMemory> {
    let lo = arena.grow(size)?;
    let heap = Heap::format(arena, lo, size);
    Ok(Box::new(Self {
      lo,
      hi: lo + size,
      owner: AtomicU32::new(owner),
      heap: UnsafeCell::new(heap),
      remote_free: AtomicUsize::new(NIL),
    }))
  }

  /// A segment with no region, for threads that arrive once the arena is
  /// full. Its lists still take overflow blocks.
  fn detached(owner: u32) -> Box<Self> {
    Box::new(Self {
      lo: 0,
      hi: 0,
      owner: AtomicU32::new(owner),
      heap: UnsafeCell::new(Heap::empty()),
      remote_free: AtomicUsize::new(NIL),
    })
  }

  #[inline]
  fn contains(&self, offset: usize) -> bool {
    offset >= self.lo && offset < self.hi
  }

  /// # Safety
  ///
  /// The calling thread must own the segment and hold no other reference to
  /// its heap.
  #[inline]
  #[allow(clippy::mut_from_ref)]
  unsafe fn heap(&self) -> &mut Heap {
    unsafe { &mut *self.heap.get() }
  }

  /// Takes ownership of an orphaned segment and settles its pending frees.
  fn claim(&self, arena: &Arena, tid: u32) -> bool {
    if self
      .owner
      .compare_exchange(OWNER_ORPHAN, tid, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      return false;
    }
    unsafe { self.drain_remote(arena, self.heap()) };
    true
  }

  fn push_remote(&self, arena: &Arena, block: Block) {
    let mut head = self.remote_free.load(Ordering::Relaxed);
    loop {
      arena.store(block.offset(), head);
      match self.remote_free.compare_exchange_weak(
        head,
        block.offset(),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return,
        Err(current) => head = current,
      }
    }
  }

  fn drain_remote(&self, arena: &Arena, heap: &mut Heap) {
    if self.remote_free.load(Ordering::Relaxed) == NIL {
      return;
    }
    let mut cur = self.remote_free.swap(NIL, Ordering::Acquire);
    while cur != NIL {
      let next = arena.load(cur);
      heap.release(arena, Block::at(cur));
      cur = next;
    }
  }
}

#[derive(Default)]
struct Segments {
  /// Sorted by address; the arena only grows upward.
  carved: Vec<Box<Segment>>,
  detached: Vec<Box<Segment>>,
}

impl Segments {
  fn all(&self) -> impl Iterator<Item = &Segment> {
    self.carved.iter().chain(self.detached.iter()).map(|s| &**s)
  }
}

// =============================================================================
// Shared state
// =============================================================================

struct Shared {
  id: usize,
  arena: Arena,
  segment_size: usize,
  large_threshold: usize,
  segments: SpinMutex<Segments>,
  pages: PageAllocator,
}

impl Shared {
  fn register(&self, tid: u32) -> NonNull<Segment> {
    let mut segments = self.segments.lock();
    if let Some(segment) = segments.all().find(|s| s.claim(&self.arena, tid)) {
      log::debug!(
        "sharded: thread {tid} claimed segment [{:#x}, {:#x})",
        segment.lo,
        segment.hi
      );
      return NonNull::from(segment);
    }

    match Segment::carve(&self.arena, self.segment_size, tid) {
      Ok(segment) => {
        log::debug!(
          "sharded: thread {tid} carved segment [{:#x}, {:#x})",
          segment.lo,
          segment.hi
        );
        let ptr = NonNull::from(&*segment);
        segments.carved.push(segment);
        ptr
      }
      Err(_) => {
        log::warn!("sharded: no room for a segment, thread {tid} runs on overflow blocks");
        let segment = Segment::detached(tid);
        let ptr = NonNull::from(&*segment);
        segments.detached.push(segment);
        ptr
      }
    }
  }

  /// The carved segment holding `offset`, if any.
  fn segment_of(&self, offset: usize) -> Option<&Segment> {
    let segments = self.segments.lock();
    let index = segments.carved.partition_point(|s| s.lo <= offset);
    let segment = segments.carved.get(index.checked_sub(1)?)?;
    // Boxed segments live as long as `self`.
    segment
      .contains(offset)
      .then(|| unsafe { &*(&**segment as *const Segment) })
  }

  /// A block of `asize` bytes in its own chunk, framed like a tiny heap so
  /// neighbor lookups stay inside it.
  fn overflow(&self, asize: usize) -> Option<Block> {
    let bytes = asize.checked_add(DSIZE)?;
    let chunk = self.arena.grow(bytes).ok()?;
    self.arena.store(chunk, pack(0, true));
    let block = Block::at(chunk + DSIZE);
    block.write(&self.arena, asize, true);
    self.arena.store(chunk + bytes - WSIZE, pack(0, true));
    log::trace!("sharded: overflow block of {asize} bytes at {chunk:#x}");
    Some(block)
  }
}

// =============================================================================
// TLS
// =============================================================================

struct Registration {
  id: usize,
  shared: Weak<Shared>,
  segment: NonNull<Segment>,
}

impl Drop for Registration {
  fn drop(&mut self) {
    // Allocator already gone: the segment went with it.
    let Some(_shared) = self.shared.upgrade() else {
      return;
    };
    unsafe { self.segment.as_ref() }
      .owner
      .store(OWNER_ORPHAN, Ordering::Release);
  }
}

thread_local! {
  static REGISTRATIONS: RefCell<Vec<Registration>> = const { RefCell::new(Vec::new()) };
}

// =============================================================================
// Allocator
// =============================================================================

/// Allocator with one private heap segment per thread. Cloning shares the
/// same instance.
#[derive(Clone)]
pub struct ShardedAllocator {
  shared: Arc<Shared>,
}

impl ShardedAllocator {
  /// Reserves the arena and carves `config.segments` segments up front.
  pub fn new(config: &Config) -> Result<Self, InitError> {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

    config.validate()?;
    let arena = Arena::new(config.arena_capacity)?;
    let segment_size = config.segment_bytes();
    let mut segments = Segments::default();
    for _ in 0..config.segments {
      segments
        .carved
        .push(Segment::carve(&arena, segment_size, OWNER_ORPHAN)?);
    }
    log::debug!(
      "sharded: {} segments of {segment_size} bytes, large threshold {}",
      config.segments,
      config.large_threshold
    );

    Ok(Self {
      shared: Arc::new(Shared {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        arena,
        segment_size,
        large_threshold: config.large_threshold,
        segments: SpinMutex::new(segments),
        pages: PageAllocator::new(),
      }),
    })
  }

  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let shared = &*self.shared;
    let arena = &shared.arena;
    if size > shared.large_threshold {
      return shared.pages.allocate(arena, size).map(|p| arena.ptr(p));
    }

    let asize = malloc_block_size(size)?;
    let segment = self.local()?;
    let heap = unsafe { segment.heap() };
    segment.drain_remote(arena, heap);
    let block = match heap.take(arena, asize) {
      Some(block) => block,
      None => shared.overflow(asize)?,
    };
    Some(arena.ptr(block.offset()))
  }

  /// Frees a block from any thread. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this allocator.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let shared = &*self.shared;
    let arena = &shared.arena;
    let Some(offset) = self.offset_of(ptr) else {
      log::warn!("sharded: ignoring free of foreign pointer {ptr:p}");
      return;
    };
    if PageAllocator::is_page(arena, offset) {
      shared.pages.free(arena, offset);
      return;
    }

    let block = Block::at(offset);
    if let Some(segment) = self.registered()
      && segment.contains(offset)
    {
      let heap = unsafe { segment.heap() };
      segment.drain_remote(arena, heap);
      heap.release(arena, block);
      return;
    }

    if let Some(owner) = shared.segment_of(offset) {
      owner.push_remote(arena, block);
    } else if let Some(segment) = self.local() {
      unsafe { segment.heap() }.release_detached(arena, block);
    } else {
      log::debug!("sharded: thread is exiting, dropping overflow block at {offset:#x}");
    }
  }

  /// Resizes a block, keeping the first `min(old, size)` bytes.
  ///
  /// Blocks in the caller's own segment are shrunk or grown in place when
  /// possible. Anything else that still fits is returned as is; otherwise the
  /// data moves to a fresh allocation. On failure the original is untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this allocator.
  pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      unsafe { self.deallocate(ptr) };
      return None;
    }
    let Some(current) = NonNull::new(ptr) else {
      return self.allocate(size);
    };
    let Some(offset) = self.offset_of(ptr) else {
      log::warn!("sharded: ignoring realloc of foreign pointer {ptr:p}");
      return None;
    };

    let shared = &*self.shared;
    let arena = &shared.arena;
    let old_usable = if PageAllocator::is_page(arena, offset) {
      let usable = PageAllocator::usable(arena, offset);
      if size <= usable {
        return Some(current);
      }
      usable
    } else {
      let block = Block::at(offset);
      let asize = block_size(size)?;
      let old_size = block.size(arena);
      let own = self.registered().filter(|s| s.contains(offset));
      match own {
        Some(segment) if size <= shared.large_threshold => {
          let heap = unsafe { segment.heap() };
          segment.drain_remote(arena, heap);
          if asize <= old_size {
            heap.shrink(arena, block, asize, true);
            return Some(current);
          }
          if let Some(grown) = heap.grow_in_place(arena, block, asize) {
            return Some(arena.ptr(grown.offset()));
          }
        }
        _ if asize <= old_size => return Some(current),
        _ => {}
      }
      old_size - DSIZE
    };

    let moved = self.allocate(size)?;
    unsafe { ptr::copy_nonoverlapping(ptr, moved.as_ptr(), old_usable.min(size)) };
    unsafe { self.deallocate(ptr) };
    Some(moved)
  }

  /// Payload bytes available at `ptr`, or 0 for null, foreign and
  /// interior pointers.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    let Some(offset) = self.offset_of(ptr) else {
      return 0;
    };
    let arena = &self.shared.arena;
    if PageAllocator::is_page(arena, offset) {
      PageAllocator::checked_usable(arena, offset)
    } else {
      Block::at(offset).checked_usable(arena, arena.len())
    }
    .unwrap_or(0)
  }

  pub fn arena(&self) -> &Arena {
    &self.shared.arena
  }

  /// Segments carved so far, pre-carved ones included.
  pub fn segment_count(&self) -> usize {
    self.shared.segments.lock().carved.len()
  }

  /// Checks the calling thread's segment, every orphaned segment and the
  /// page lists. Segments held by other live threads are skipped.
  #[cfg(feature = "heap-check")]
  pub fn check(&self) -> Result<(), crate::error::HeapError> {
    let shared = &*self.shared;
    let tid = thread_id_u32();
    let mine = self.registered().map(NonNull::from);
    let segments = shared.segments.lock();
    for segment in segments.all() {
      let borrowed = mine != Some(NonNull::from(segment));
      if borrowed && !segment.claim(&shared.arena, tid) {
        continue;
      }
      let result = crate::check::check_heap(&shared.arena, unsafe { segment.heap() });
      if borrowed {
        segment.owner.store(OWNER_ORPHAN, Ordering::Release);
      }
      result?;
    }
    crate::check::check_pages(&shared.arena, &shared.pages)
  }

  fn offset_of(&self, ptr: *const u8) -> Option<usize> {
    self
      .shared
      .arena
      .offset_of(ptr)
      .filter(|offset| offset % DSIZE == 0 && *offset >= DSIZE)
  }

  /// The calling thread's segment, if it has registered.
  fn registered(&self) -> Option<&Segment> {
    let id = self.shared.id;
    let segment = REGISTRATIONS
      .try_with(|regs| {
        regs
          .borrow()
          .iter()
          .find(|r| r.id == id)
          .map(|r| r.segment)
      })
      .ok()
      .flatten()?;
    Some(unsafe { segment.as_ref() })
  }

  /// The calling thread's segment, registering it on first use. `None` once
  /// the thread's locals are being torn down.
  fn local(&self) -> Option<&Segment> {
    if let Some(segment) = self.registered() {
      return Some(segment);
    }
    let segment = self.shared.register(thread_id_u32());
    let registration = Registration {
      id: self.shared.id,
      shared: Arc::downgrade(&self.shared),
      segment,
    };
    // If the slot is gone the registration drops unused and orphans the
    // segment again.
    REGISTRATIONS
      .try_with(move |regs| {
        let mut regs = regs.borrow_mut();
        regs.retain(|r| r.shared.strong_count() > 0);
        regs.push(registration);
      })
      .ok()?;
    Some(unsafe { segment.as_ref() })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::page_size;
  use std::thread;

  fn config(segments: usize) -> Config {
    Config::default()
      .with_arena_capacity(64 << 20)
      .with_segment_size(256 << 10)
      .with_segments(segments)
  }

  fn segment_bounds(alloc: &ShardedAllocator, ptr: NonNull<u8>) -> Option<(usize, usize)> {
    let offset = alloc.arena().offset_of(ptr.as_ptr())?;
    alloc.shared.segment_of(offset).map(|s| (s.lo, s.hi))
  }

  #[test]
  fn same_thread_reuse() {
    let alloc = ShardedAllocator::new(&config(2)).unwrap();
    let p = alloc.allocate(24).unwrap();
    let _q = alloc.allocate(24).unwrap();
    unsafe { alloc.deallocate(p.as_ptr()) };
    assert_eq!(alloc.allocate(24), Some(p));
    alloc.check().unwrap();
  }

  #[test]
  fn threads_get_distinct_segments() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let mine = alloc.allocate(64).unwrap();
    let other = {
      let alloc = alloc.clone();
      thread::spawn(move || alloc.allocate(64).unwrap().as_ptr() as usize)
        .join()
        .unwrap()
    };
    let other = NonNull::new(other as *mut u8).unwrap();
    // One segment was pre-carved; the second thread had to carve its own.
    assert_eq!(alloc.segment_count(), 2);
    assert_ne!(segment_bounds(&alloc, mine), segment_bounds(&alloc, other));
  }

  #[test]
  fn cross_thread_free_is_drained_by_owner() {
    let alloc = ShardedAllocator::new(&config(2)).unwrap();
    let p = alloc.allocate(100).unwrap();
    let _guard = alloc.allocate(100).unwrap();
    let addr = p.as_ptr() as usize;
    {
      let alloc = alloc.clone();
      thread::spawn(move || unsafe { alloc.deallocate(addr as *mut u8) })
        .join()
        .unwrap();
    }
    // Still allocated until the owner drains its queue.
    assert!(Block::at(alloc.arena().offset_of(p.as_ptr()).unwrap()).is_allocated(alloc.arena()));
    assert_eq!(alloc.allocate(100), Some(p));
    alloc.check().unwrap();
  }

  #[test]
  fn exited_thread_segment_is_adopted() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let addr = {
      let alloc = alloc.clone();
      thread::spawn(move || alloc.allocate(48).unwrap().as_ptr() as usize)
        .join()
        .unwrap()
    };
    // Freed before this thread registers: it lands on the orphan's queue.
    unsafe { alloc.deallocate(addr as *mut u8) };
    let p = alloc.allocate(48).unwrap();
    assert_eq!(p.as_ptr() as usize, addr);
    assert_eq!(alloc.segment_count(), 1);
    alloc.check().unwrap();
  }

  #[test]
  fn full_segment_spills_into_overflow_blocks() {
    let alloc = ShardedAllocator::new(
      &Config::default()
        .with_arena_capacity(16 << 20)
        .with_segment_size(page_size())
        .with_segments(1),
    )
    .unwrap();
    let mut live = Vec::new();
    for _ in 0..64 {
      live.push(alloc.allocate(1024).unwrap());
    }
    let spilled = live
      .iter()
      .filter(|p| segment_bounds(&alloc, **p).is_none())
      .count();
    assert!(spilled > 0);

    for p in &live {
      unsafe { alloc.deallocate(p.as_ptr()) };
    }
    alloc.check().unwrap();

    // Freed overflow blocks are reused before the arena grows again.
    let used = alloc.arena().len();
    let again = alloc.allocate(1024).unwrap();
    assert!(live.contains(&again));
    assert_eq!(alloc.arena().len(), used);
  }

  #[test]
  fn large_requests_use_pages() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let big = alloc.allocate(100 << 10).unwrap();
    let offset = alloc.arena().offset_of(big.as_ptr()).unwrap();
    assert!(PageAllocator::is_page(alloc.arena(), offset));
    assert!(alloc.usable_size(big.as_ptr()) >= 100 << 10);
    assert_eq!(alloc.usable_size(big.as_ptr()) % DSIZE, 0);

    unsafe { alloc.deallocate(big.as_ptr()) };
    assert_eq!(alloc.allocate(100 << 10), Some(big));
    alloc.check().unwrap();
  }

  #[test]
  fn interior_pointers_have_no_usable_size() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let small = alloc.allocate(256).unwrap();
    let big = alloc.allocate(100 << 10).unwrap();
    unsafe {
      small.as_ptr().write_bytes(0, 256);
      big.as_ptr().write_bytes(0, 256);
      assert_eq!(alloc.usable_size(small.as_ptr().add(64)), 0);
      assert_eq!(alloc.usable_size(big.as_ptr().add(64)), 0);
    }
    assert!(alloc.usable_size(small.as_ptr()) >= 256);
    assert!(alloc.usable_size(big.as_ptr()) >= 100 << 10);
    alloc.check().unwrap();
  }

  #[test]
  fn realloc_moves_between_small_and_large() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let p = alloc.allocate(64).unwrap();
    for i in 0..64 {
      unsafe { p.as_ptr().add(i).write(i as u8) };
    }
    let big = unsafe { alloc.reallocate(p.as_ptr(), 64 << 10) }.unwrap();
    assert!(PageAllocator::is_page(
      alloc.arena(),
      alloc.arena().offset_of(big.as_ptr()).unwrap()
    ));
    // Shrinking a page block that still fits keeps it.
    assert_eq!(unsafe { alloc.reallocate(big.as_ptr(), 40 << 10) }, Some(big));
    let bigger = unsafe { alloc.reallocate(big.as_ptr(), 128 << 10) }.unwrap();
    assert_ne!(bigger, big);
    assert_eq!(unsafe { alloc.reallocate(bigger.as_ptr(), 32) }, Some(bigger));
    for i in 0..64 {
      assert_eq!(unsafe { bigger.as_ptr().add(i).read() }, i as u8);
    }
    alloc.check().unwrap();
  }

  #[test]
  fn realloc_in_own_segment_grows_in_place() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    let p = alloc.allocate(64).unwrap();
    let q = alloc.allocate(512).unwrap();
    let _guard = alloc.allocate(16).unwrap();
    unsafe { alloc.deallocate(q.as_ptr()) };
    assert_eq!(unsafe { alloc.reallocate(p.as_ptr(), 400) }, Some(p));
    alloc.check().unwrap();
  }

  #[test]
  fn realloc_of_foreign_block_copies() {
    let alloc = ShardedAllocator::new(&config(2)).unwrap();
    let _mine = alloc.allocate(8).unwrap();
    let addr = {
      let alloc = alloc.clone();
      thread::spawn(move || {
        let p = alloc.allocate(32).unwrap();
        unsafe { p.as_ptr().write_bytes(0xab, 32) };
        p.as_ptr() as usize
      })
      .join()
      .unwrap()
    };
    let ptr = addr as *mut u8;
    let moved = unsafe { alloc.reallocate(ptr, 300) }.unwrap();
    assert_ne!(moved.as_ptr(), ptr);
    assert!((0..32).all(|i| unsafe { moved.as_ptr().add(i).read() } == 0xab));
    alloc.check().unwrap();
  }

  #[test]
  fn zero_null_and_foreign() {
    let alloc = ShardedAllocator::new(&config(1)).unwrap();
    assert_eq!(alloc.allocate(0), None);
    unsafe { alloc.deallocate(ptr::null_mut()) };
    let mut local = 0u128;
    unsafe { alloc.deallocate((&mut local as *mut u128).cast()) };
    assert_eq!(alloc.usable_size(ptr::null()), 0);
    alloc.check().unwrap();
  }
}
