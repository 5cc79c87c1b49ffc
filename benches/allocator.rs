use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

pub mod pmalloc_bench {
    use super::*;
    use pmalloc::Allocator;

    pub fn allocate_deallocate(ctx: &mut Criterion) {
        let mut group = ctx.benchmark_group("pmalloc::alloc_dealloc");

        group.throughput(Throughput::Elements(1));

        group.bench_function("alloc-dealloc 64", |b| {
            let mut path = std::env::temp_dir();
            path.push(format!("pmalloc-bench-{}", std::process::id()));
            for section in ["meta", "desc", "sb"].iter() {
                let _ = std::fs::remove_file(format!("{}_{}", path.display(), section));
            }

            let (allocator, _) =
                Allocator::attach(&path, 1).expect("The Bench-Region should always attach");

            b.iter(|| {
                let ptr = allocator
                    .allocate(64)
                    .expect("The Bench-Region is large enough for a single Block");
                allocator.free(black_box(ptr.as_ptr()));
            });
        });
    }
}

pub mod system_alloc {
    use super::*;
    use std::alloc::{GlobalAlloc, Layout};

    pub fn allocate_deallocate(ctx: &mut Criterion) {
        let mut group = ctx.benchmark_group("system_alloc::alloc_dealloc");

        group.throughput(Throughput::Elements(1));

        group.bench_function("alloc-dealloc 64", |b| {
            let allocator = std::alloc::System;
            let layout = Layout::from_size_align(64, 8).unwrap();

            b.iter(|| {
                let ptr = unsafe { allocator.alloc(layout) };
                unsafe { allocator.dealloc(black_box(ptr), layout) };
            });
        });
    }
}

criterion_group!(
    allocator,
    pmalloc_bench::allocate_deallocate,
    system_alloc::allocate_deallocate
);
criterion_main!(allocator);
