use thiserror::Error;

/// The arena cannot hand out the requested bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("arena exhausted: requested {requested} bytes with {available} bytes left")]
pub struct OutOfMemory {
  pub requested: usize,
  pub available: usize,
}

/// Failure to bring an allocator instance up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
  #[error("could not reserve the arena")]
  Reserve(#[from] OutOfMemory),
  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),
}

/// Heap corruption found by the consistency checker.
///
/// Offsets are arena offsets of the block payload. None of these are
/// recoverable: a caller that sees one should abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
  #[error("block at {offset:#x}: header {header:#x} differs from footer {footer:#x}")]
  HeaderFooterMismatch {
    offset: usize,
    header: usize,
    footer: usize,
  },
  #[error("block at {offset:#x} has invalid size {size}")]
  BadSize { offset: usize, size: usize },
  #[error("block at {offset:#x} is free and so is its successor")]
  Uncoalesced { offset: usize },
  #[error("free block at {offset:#x} is on no free list")]
  Unlisted { offset: usize },
  #[error("block at {offset:#x} is on a free list but marked allocated")]
  AllocatedListed { offset: usize },
  #[error("block at {offset:#x} is on list {class} but belongs to list {expected}")]
  WrongClass {
    offset: usize,
    class: usize,
    expected: usize,
  },
  #[error("free list {class} has a broken link at {offset:#x}")]
  BrokenLink { class: usize, offset: usize },
  #[error("free blocks at {first:#x} and {second:#x} overlap")]
  Overlap { first: usize, second: usize },
  #[error("region ending at {offset:#x} has no epilogue")]
  BadEpilogue { offset: usize },
  #[error("page block at {offset:#x} is malformed")]
  BadPageBlock { offset: usize },
}
