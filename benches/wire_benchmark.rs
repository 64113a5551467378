//! Wire Format Benchmarks
//!
//! Measures register record parsing and entry rendering.
//!
//! Run with:
//!   cargo bench --bench wire_benchmark

use binfmt_misc_fs::wire::{decode_escapes, register, render_entry, RegisterRecord};
use binfmt_misc_fs::{BinfmtMisc, Registry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const QEMU_ARM: &[u8] = b":qemu-arm:M::\\x7fELF\\x01\\x01\\x01\\x00\\x00\\x00\\x00\\x00\\x00\\x00\\x00\\x00\\x02\\x00\\x28\\x00:\\xff\\xff\\xff\\xff\\xff\\xff\\xff\\x00\\xff\\xff\\xff\\xff\\xff\\xff\\xff\\xff\\xfe\\xff\\xff\\xff:/usr/bin/qemu-arm-static:OCF\n";

fn bench_decode_escapes(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_escapes");

    for len in [4usize, 16, 64] {
        let field: Vec<u8> = (0..len)
            .flat_map(|i| format!("\\x{:02x}", i as u8).into_bytes())
            .collect();
        group.throughput(Throughput::Bytes(field.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &field, |b, field| {
            b.iter(|| decode_escapes(black_box(field)).unwrap())
        });
    }

    group.finish();
}

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");
    group.throughput(Throughput::Bytes(QEMU_ARM.len() as u64));

    group.bench_function("parse_record", |b| {
        b.iter(|| RegisterRecord::parse(black_box(QEMU_ARM)).unwrap())
    });

    group.bench_function("parse_and_insert", |b| {
        b.iter(|| {
            let mut registry = Registry::new();
            register(&mut registry, black_box(QEMU_ARM)).unwrap()
        })
    });

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut fs = BinfmtMisc::new();
    fs.write("/register", QEMU_ARM).unwrap();

    c.bench_function("render_entry", |b| {
        b.iter(|| render_entry(fs.registry(), black_box("qemu-arm")).unwrap())
    });

    c.bench_function("read_entry", |b| {
        b.iter(|| fs.read(black_box("/qemu-arm"), 0, 4096).unwrap())
    });
}

criterion_group!(benches, bench_decode_escapes, bench_register, bench_render);
criterion_main!(benches);
