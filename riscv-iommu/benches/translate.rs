use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memory::{MemoryBus, PhysicalMemory};
use riscv_iommu::{IommuConfig, Perm};

fn bare_mode_translate(c: &mut Criterion) {
    let iommu = riscv_iommu::Iommu::new(
        IommuConfig::default(),
        Box::new(PhysicalMemory::new(1 << 16)),
        Box::new(|_vector: u8| {}),
    );
    // DDTP.MODE = BARE.
    iommu.write(0x0010, 1, 8).unwrap();

    c.bench_function("iommu_translate_bare_pass_through", |b| {
        b.iter(|| {
            let result = iommu.translate(black_box(0x42), 0, black_box(0xDEAD_F000), Perm::Rw);
            black_box(result)
        })
    });
}

fn repeated_devid_hits_context_cache(c: &mut Criterion) {
    let iommu = riscv_iommu::Iommu::new(
        IommuConfig::default(),
        Box::new(PhysicalMemory::new(1 << 16)),
        Box::new(|_vector: u8| {}),
    );
    iommu.write(0x0010, 1, 8).unwrap();
    iommu.translate(0x7, 0, 0x1000, Perm::Ro).unwrap();

    c.bench_function("iommu_translate_cached_context", |b| {
        b.iter(|| {
            let result = iommu.translate(black_box(0x7), 0, black_box(0x2000), Perm::Ro);
            black_box(result)
        })
    });
}

fn memory_round_trip(c: &mut Criterion) {
    let mut mem = PhysicalMemory::new(1 << 16);
    c.bench_function("translate_backing_store_u64_round_trip", |b| {
        b.iter(|| {
            mem.write_u64(black_box(0x100), black_box(0xCAFE_BABE))
                .unwrap();
            black_box(mem.read_u64(0x100).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bare_mode_translate,
    repeated_devid_hits_context_cache,
    memory_round_trip
);
criterion_main!(benches);
