use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ratchat_sync::crypto::{decrypt_text, encrypt_bytes, encrypt_text};
use ratchat_sync::{Checksum, SymmetricKey};
use std::hint::black_box;

fn bench_message_codec(c: &mut Criterion) {
    let key = SymmetricKey::from_passphrase("bench");
    let text = "the quick brown rat jumps over the lazy server ".repeat(8);
    let sealed = encrypt_text(&key, &text).unwrap();

    let mut group = c.benchmark_group("message");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encrypt_text", |b| {
        b.iter(|| encrypt_text(black_box(&key), black_box(&text)).unwrap())
    });
    group.bench_function("decrypt_text", |b| {
        b.iter(|| decrypt_text(black_box(&key), black_box(&sealed)).unwrap())
    });
    group.finish();
}

fn bench_file_paths(c: &mut Criterion) {
    let key = SymmetricKey::from_passphrase("bench");
    let mut group = c.benchmark_group("file");

    for size in [16_384usize, 1 << 20] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("checksum", size), &data, |b, data| {
            b.iter(|| Checksum::compute(black_box(data)))
        });
        group.bench_with_input(BenchmarkId::new("seal_chunk", size), &data, |b, data| {
            b.iter(|| encrypt_bytes(black_box(&key), black_box(data)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_message_codec, bench_file_paths);
criterion_main!(benches);
