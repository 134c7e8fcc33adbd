use criterion::{black_box, criterion_group, criterion_main, Criterion};
use propar::framing::{encode, Decoder};

fn bench_encode(c: &mut Criterion) {
    let body: Vec<u8> = (0..=255).cycle().take(200).map(|b| b as u8).collect();

    c.bench_function("frame_encode", |b| {
        b.iter(|| encode(black_box(&body)));
    });
}

fn bench_decode(c: &mut Criterion) {
    let body: Vec<u8> = (0..=255).cycle().take(200).map(|b| b as u8).collect();
    let frame = encode(&body);

    c.bench_function("frame_decode", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            let mut out = Vec::new();
            decoder.feed(black_box(&frame), &mut out);
            out
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
