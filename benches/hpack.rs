//! HPACK header block encoding and decoding.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pulsenet::http::h2::hpack::{Decoder, Encoder};

fn request_fields() -> Vec<(&'static [u8], &'static [u8])> {
    vec![
        (&b":method"[..], &b"GET"[..]),
        (&b":scheme"[..], &b"https"[..]),
        (&b":authority"[..], &b"api.example.com"[..]),
        (&b":path"[..], &b"/v1/items?page=2&sort=desc"[..]),
        (&b"accept"[..], &b"application/json"[..]),
        (&b"accept-encoding"[..], &b"gzip, deflate, br"[..]),
        (&b"user-agent"[..], &b"pulsenet/0.1"[..]),
        (&b"authorization"[..], &b"Bearer eyJhbGciOiJIUzI1NiJ9.e30.signature"[..]),
    ]
}

fn benchmark_encode(c: &mut Criterion) {
    let fields = request_fields();

    c.bench_function("hpack_encode_cold", |b| {
        b.iter(|| {
            let mut encoder = Encoder::new(4096);
            let mut dst = BytesMut::with_capacity(256);
            encoder.encode(fields.iter().copied(), &mut dst);
            black_box(dst)
        })
    });

    // repeated requests on one connection hit the dynamic table
    let mut encoder = Encoder::new(4096);
    c.bench_function("hpack_encode_warm", |b| {
        b.iter(|| {
            let mut dst = BytesMut::with_capacity(256);
            encoder.encode(fields.iter().copied(), &mut dst);
            black_box(dst)
        })
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let mut block = BytesMut::new();
    Encoder::new(4096).encode(request_fields(), &mut block);

    c.bench_function("hpack_decode", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new(4096);
            black_box(decoder.decode(black_box(&block)).unwrap())
        })
    });
}

criterion_group!(benches, benchmark_encode, benchmark_decode);
criterion_main!(benches);
