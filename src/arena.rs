//! The backing memory region every block is carved from.
//!
//! One `mmap` reservation of `capacity` bytes is made up front; [`Arena::grow`]
//! then moves a break cursor through it, like `sbrk` on a data segment with a
//! fixed maximum. Memory is never handed back until the arena is dropped.
//!
//! Everything past this module addresses the arena by byte offset. The word
//! accessors are the one place where offsets become pointers, so bounds and
//! alignment are asserted here instead of at every call site.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{WSIZE, align_up, error::OutOfMemory, sync::SpinLock};

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Virtual memory page size in bytes.
pub fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

pub struct Arena {
  base: NonNull<u8>,
  capacity: usize,
  /// Bytes handed out so far. Only written under `grow_lock`.
  brk: AtomicUsize,
  grow_lock: SpinLock,
  page_size: usize,
}

// The arena only hands out disjoint ranges; callers coordinate access to them.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Reserves `capacity` bytes (rounded up to a page). The base is page
  /// aligned, so every offset that is a multiple of `DSIZE` yields a
  /// `DSIZE`-aligned address.
  pub fn new(capacity: usize) -> Result<Self, OutOfMemory> {
    let page_size = page_size();
    let capacity = align_up(capacity.max(page_size), page_size);
    let raw = unsafe { os_mmap(capacity) };
    let Some(base) = NonNull::new(raw) else {
      log::warn!("arena: mmap of {capacity} bytes failed");
      return Err(OutOfMemory {
        requested: capacity,
        available: 0,
      });
    };
    log::debug!("arena: reserved {capacity} bytes at {base:p}");
    Ok(Self {
      base,
      capacity,
      brk: AtomicUsize::new(0),
      grow_lock: SpinLock::new(),
      page_size,
    })
  }

  /// Extends the break by `bytes` and returns the offset of the new range.
  /// Fails without side effects once the reservation would be exceeded.
  pub(crate) fn grow(&self, bytes: usize) -> Result<usize, OutOfMemory> {
    self.grow_lock.lock();
    let old = self.brk.load(Ordering::Relaxed);
    let available = self.capacity - old;
    let result = if bytes <= available {
      self.brk.store(old + bytes, Ordering::Release);
      Ok(old)
    } else {
      Err(OutOfMemory {
        requested: bytes,
        available,
      })
    };
    self.grow_lock.unlock();

    match result {
      Ok(offset) => log::trace!("arena: grew by {bytes} at {offset:#x}"),
      Err(e) => log::warn!("arena: {e}"),
    }
    result
  }

  /// Bytes handed out so far.
  #[inline]
  pub fn len(&self) -> usize {
    self.brk.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Address of `offset`.
  #[inline]
  pub(crate) fn ptr(&self, offset: usize) -> NonNull<u8> {
    debug_assert!(offset <= self.capacity);
    unsafe { self.base.add(offset) }
  }

  /// Offset of `ptr` if it lies in the handed-out part of the arena.
  #[inline]
  pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<usize> {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    if addr >= base && addr < base + self.len() {
      Some(addr - base)
    } else {
      None
    }
  }

  #[inline]
  pub(crate) fn load(&self, offset: usize) -> usize {
    self.check_word(offset);
    unsafe { self.base.add(offset).cast::<usize>().read() }
  }

  #[inline]
  pub(crate) fn store(&self, offset: usize, value: usize) {
    self.check_word(offset);
    unsafe { self.base.add(offset).cast::<usize>().write(value) }
  }

  /// Overlap-safe byte move inside the arena.
  #[inline]
  pub(crate) fn copy(&self, src: usize, dst: usize, len: usize) {
    debug_assert!(src + len <= self.len() && dst + len <= self.len());
    unsafe { ptr::copy(self.ptr(src).as_ptr(), self.ptr(dst).as_ptr(), len) }
  }

  #[inline(always)]
  fn check_word(&self, offset: usize) {
    debug_assert!(
      offset % WSIZE == 0,
      "arena: unaligned word offset {offset:#x}"
    );
    debug_assert!(
      offset + WSIZE <= self.len(),
      "arena: word offset {offset:#x} past break {:#x}",
      self.len()
    );
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn grow_hands_out_contiguous_ranges() {
    let arena = Arena::new(1 << 16).unwrap();
    assert!(arena.is_empty());
    assert_eq!(arena.grow(64).unwrap(), 0);
    assert_eq!(arena.grow(32).unwrap(), 64);
    assert_eq!(arena.len(), 96);
  }

  #[test]
  fn grow_fails_past_capacity_without_moving_break() {
    let arena = Arena::new(page_size()).unwrap();
    let cap = arena.capacity();
    arena.grow(cap - 16).unwrap();
    let err = arena.grow(32).unwrap_err();
    assert_eq!(err.requested, 32);
    assert_eq!(err.available, 16);
    assert_eq!(arena.len(), cap - 16);
    assert_eq!(arena.grow(16).unwrap(), cap - 16);
  }

  #[test]
  fn words_round_trip_and_base_is_page_aligned() {
    let arena = Arena::new(1 << 16).unwrap();
    arena.grow(64).unwrap();
    assert_eq!(arena.ptr(0).as_ptr() as usize % arena.page_size(), 0);
    arena.store(8, 0xdead_beef);
    assert_eq!(arena.load(8), 0xdead_beef);
    let p = arena.ptr(8).as_ptr();
    assert_eq!(arena.offset_of(p), Some(8));
    assert_eq!(arena.offset_of(arena.ptr(64).as_ptr()), None);
  }
}
