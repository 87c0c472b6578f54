//! 청커 벤치마크
//!
//! Flex/SysEx8 조각화와 재조립 처리량 측정

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use som::{FlexPacker, SysEx8Packer};

fn bench_flex(c: &mut Criterion) {
    let payload = vec![0xABu8; 384];
    let packer = FlexPacker::new();
    let packed = packer.pack(&payload, 0x1, 0x01, 0x01);

    let mut group = c.benchmark_group("flex");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("pack_384b", |b| {
        b.iter(|| packer.pack(black_box(&payload), 0x1, 0x01, 0x01))
    });

    group.bench_function("unpack_384b", |b| {
        b.iter(|| {
            let mut unpacker = FlexPacker::new();
            unpacker.unpack(black_box(&packed))
        })
    });

    group.finish();
}

fn bench_sysex8(c: &mut Criterion) {
    let blob = vec![0xCDu8; 5 * 1024];
    let packer = SysEx8Packer::new();
    let packed = packer.pack(0x00, &blob, 0x1);

    let mut group = c.benchmark_group("sysex8");
    group.throughput(Throughput::Bytes(blob.len() as u64));

    group.bench_function("pack_5k", |b| {
        b.iter(|| packer.pack(0x00, black_box(&blob), 0x1))
    });

    group.bench_function("unpack_5k", |b| {
        b.iter(|| {
            let mut unpacker = SysEx8Packer::new();
            unpacker.unpack(black_box(&packed))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_flex, bench_sysex8);
criterion_main!(benches);
