use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segfit::{Allocator, Config, LockedAllocator, ShardedAllocator};
use std::hint::black_box;

const OPS: u64 = 100_000;
const ARENA: usize = 512 << 20;

/// Single-heap alloc/free throughput.
fn single_malloc_free(alloc: &mut Allocator, size: usize) {
  for _ in 0..OPS {
    let ptr = alloc.allocate(size);
    black_box(ptr);
    if let Some(ptr) = ptr {
      unsafe { alloc.deallocate(ptr.as_ptr()) };
    }
  }
}

/// Locked-heap alloc/free throughput, uncontended.
fn locked_malloc_free(alloc: &LockedAllocator, size: usize) {
  for _ in 0..OPS {
    let ptr = alloc.allocate(size);
    black_box(ptr);
    if let Some(ptr) = ptr {
      unsafe { alloc.deallocate(ptr.as_ptr()) };
    }
  }
}

/// Sharded alloc/free throughput.
fn sharded_malloc_free(alloc: &ShardedAllocator, size: usize) {
  for _ in 0..OPS {
    let ptr = alloc.allocate(size);
    black_box(ptr);
    if let Some(ptr) = ptr {
      unsafe { alloc.deallocate(ptr.as_ptr()) };
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  let mut single = Allocator::new(ARENA).unwrap();
  let locked = LockedAllocator::new(ARENA).unwrap();
  let sharded = ShardedAllocator::new(&Config::default().with_arena_capacity(ARENA)).unwrap();

  for size in [16, 64, 256, 1024, 4096, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("single", size), &size, |b, &size| {
      b.iter(|| single_malloc_free(&mut single, size))
    });

    group.bench_with_input(BenchmarkId::new("locked", size), &size, |b, &size| {
      b.iter(|| locked_malloc_free(&locked, size))
    });

    group.bench_with_input(BenchmarkId::new("sharded", size), &size, |b, &size| {
      b.iter(|| sharded_malloc_free(&sharded, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Realloc growth chain: in-place growth versus libc.
fn benchmark_realloc_growth(c: &mut Criterion) {
  let mut group = c.benchmark_group("realloc_growth");
  let mut single = Allocator::new(ARENA).unwrap();

  group.bench_function("single", |b| {
    b.iter(|| {
      let mut ptr = single.allocate(16).map(|p| p.as_ptr());
      for size in (32..8192).step_by(32) {
        ptr = ptr.and_then(|p| unsafe { single.reallocate(p, size) }.map(|p| p.as_ptr()));
      }
      if let Some(p) = ptr {
        unsafe { single.deallocate(black_box(p)) };
      }
    })
  });

  group.bench_function("libc", |b| {
    b.iter(|| unsafe {
      let mut ptr = libc::malloc(16);
      for size in (32..8192).step_by(32) {
        ptr = libc::realloc(ptr, size);
      }
      libc::free(black_box(ptr));
    })
  });

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_realloc_growth);
criterion_main!(benches);
