//! Segregated-fit allocator over a fixed-size, growable arena.
//!
//! Three front ends share the same block machinery:
//!
//! - [`Allocator`]: one heap, `&mut self`, no locking
//! - [`LockedAllocator`]: the same heap behind one lock
//! - [`ShardedAllocator`]: a private heap segment per thread, plus a page
//!   allocator for large requests
//!
//! The free functions at the crate root drive one process-wide
//! [`ShardedAllocator`] set up by [`allocator_init`].

#![allow(clippy::missing_safety_doc)]

use core::{mem::size_of, ptr::NonNull};
use std::sync::OnceLock;

mod allocator;
mod arena;
mod block;
#[cfg(feature = "heap-check")]
mod check;
mod coalesce;
mod config;
mod error;
mod fit;
mod freelist;
mod heap;
mod page;
mod sharded;
mod sync;

pub use allocator::{Allocator, LockedAllocator};
pub use arena::{Arena, page_size};
pub use config::Config;
pub use error::{HeapError, InitError, OutOfMemory};
pub use sharded::ShardedAllocator;

// =============================================================================
// Constants
// =============================================================================

/// Machine word.
pub const WSIZE: usize = size_of::<usize>();
/// Double word: the payload alignment and size granule.
pub const DSIZE: usize = 2 * WSIZE;
/// Header, footer and two list links.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;
/// Size classes in each heap.
pub const NUM_CLASSES: usize = 15;
/// Requests below this are rounded up to a power of two before sizing.
pub const SMALL_ROUND_LIMIT: usize = MIN_BLOCK_SIZE << 4;
/// Page-count classes in the page allocator.
pub const PAGE_CLASSES: usize = 32;

// =============================================================================
// Compile-time assertions
// =============================================================================

const _: () = assert!(WSIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(SMALL_ROUND_LIMIT.is_power_of_two());
const _: () = assert!(NUM_CLASSES >= 2);
const _: () = assert!(PAGE_CLASSES >= 2);
// Two flag bits live under the size.
const _: () = assert!(DSIZE >= 4);

// =============================================================================
// Process-wide allocator
// =============================================================================

static GLOBAL: OnceLock<ShardedAllocator> = OnceLock::new();

/// Sets up the process-wide allocator with [`Config::default`]. Calling it
/// again is a no-op.
pub fn allocator_init() -> Result<(), InitError> {
  if GLOBAL.get().is_some() {
    return Ok(());
  }
  let allocator = ShardedAllocator::new(&Config::default())?;
  // Losing a race to another initializer is fine; the spare is dropped.
  let _ = GLOBAL.set(allocator);
  Ok(())
}

/// `None` for a zero size, an exhausted arena, or before [`allocator_init`].
pub fn allocate(size: usize) -> Option<*mut u8> {
  GLOBAL
    .get()?
    .allocate(size)
    .map(NonNull::as_ptr)
}

/// Frees a block from any thread. Null, and any call before
/// [`allocator_init`], is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by [`allocate`] or
/// [`reallocate`].
pub unsafe fn deallocate(ptr: *mut u8) {
  if let Some(allocator) = GLOBAL.get() {
    unsafe { allocator.deallocate(ptr) }
  }
}

/// Resizes a block, keeping the first `min(old, size)` bytes. A zero size
/// frees and returns `None`; null allocates. On failure the original block
/// is left as it was.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by [`allocate`] or
/// [`reallocate`].
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> Option<*mut u8> {
  let allocator = GLOBAL.get()?;
  unsafe { allocator.reallocate(ptr, size) }.map(NonNull::as_ptr)
}

/// Payload bytes at `ptr`, or 0 for null, foreign and interior pointers.
pub fn usable_size(ptr: *const u8) -> usize {
  GLOBAL.get().map_or(0, |allocator| allocator.usable_size(ptr))
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn mm_init() -> i32 {
  match allocator_init() {
    Ok(()) => 0,
    Err(_) => -1,
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn mm_malloc(size: usize) -> *mut u8 {
  allocate(size).unwrap_or(core::ptr::null_mut())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_free(ptr: *mut u8) {
  unsafe { deallocate(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { reallocate(ptr, size) }.unwrap_or(core::ptr::null_mut())
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(4097, 4096), 8192);
  }

  #[test]
  fn word_geometry() {
    assert_eq!(DSIZE, 2 * WSIZE);
    assert_eq!(MIN_BLOCK_SIZE, 4 * WSIZE);
    assert_eq!(SMALL_ROUND_LIMIT, MIN_BLOCK_SIZE * 16);
  }
}
