use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memory::{MemoryBus, PhysicalMemory};

fn bulk_round_trip(c: &mut Criterion) {
    let mut mem = PhysicalMemory::new(1 << 20);
    c.bench_function("physical_memory_u64_round_trip", |b| {
        b.iter(|| {
            mem.write_u64(black_box(0x1000), black_box(0x1122_3344_5566_7788))
                .unwrap();
            black_box(mem.read_u64(0x1000).unwrap());
        })
    });
}

criterion_group!(benches, bulk_round_trip);
criterion_main!(benches);
