//! Runtime sizing for allocator instances.

use crate::{DSIZE, MIN_BLOCK_SIZE, align_up, arena::page_size, error::InitError, heap::FRAME_SIZE};

const DEFAULT_ARENA_CAPACITY: usize = 256 << 20;
const DEFAULT_SEGMENT_SIZE: usize = 1 << 20;
const DEFAULT_SEGMENTS: usize = 4;
const MAX_DEFAULT_SEGMENTS: usize = 64;
const DEFAULT_LARGE_THRESHOLD: usize = 32 << 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Bytes reserved for the arena. Growth past this fails.
  pub arena_capacity: usize,
  /// Bytes per thread segment, rounded up to a page.
  pub segment_size: usize,
  /// Segments carved when the sharded allocator starts. More are carved on
  /// demand while the arena has room.
  pub segments: usize,
  /// Requests above this many bytes go to the page allocator.
  pub large_threshold: usize,
}

impl Default for Config {
  fn default() -> Self {
    let segments = std::thread::available_parallelism()
      .map(|n| n.get().min(MAX_DEFAULT_SEGMENTS))
      .unwrap_or(DEFAULT_SEGMENTS);
    Self {
      arena_capacity: DEFAULT_ARENA_CAPACITY,
      segment_size: DEFAULT_SEGMENT_SIZE,
      segments,
      large_threshold: DEFAULT_LARGE_THRESHOLD,
    }
  }
}

impl Config {
  pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
    self.arena_capacity = bytes;
    self
  }

  pub fn with_segment_size(mut self, bytes: usize) -> Self {
    self.segment_size = bytes;
    self
  }

  pub fn with_segments(mut self, count: usize) -> Self {
    self.segments = count;
    self
  }

  pub fn with_large_threshold(mut self, bytes: usize) -> Self {
    self.large_threshold = bytes;
    self
  }

  /// Segment size as actually carved.
  pub fn segment_bytes(&self) -> usize {
    align_up(self.segment_size, page_size())
  }

  pub fn validate(&self) -> Result<(), InitError> {
    if self.arena_capacity < FRAME_SIZE + MIN_BLOCK_SIZE {
      return Err(InitError::InvalidConfig("arena capacity too small"));
    }
    if self.segment_size < FRAME_SIZE + MIN_BLOCK_SIZE {
      return Err(InitError::InvalidConfig("segment size too small"));
    }
    if self.large_threshold < DSIZE {
      return Err(InitError::InvalidConfig("large threshold too small"));
    }
    if self.segment_bytes().saturating_mul(self.segments) > self.arena_capacity {
      return Err(InitError::InvalidConfig("segments do not fit in the arena"));
    }
    Ok(())
  }
}
