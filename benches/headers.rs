use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pulsenet::HttpRequest;
use pulsenet::HttpHeaders;

const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"),
    ("Accept-Encoding", "gzip, deflate, br"),
    ("Accept-Language", "en-GB,en;q=0.9"),
    ("Cache-Control", "max-age=0"),
    ("Cookie", "session=xxxxxxxxxxxxxxxx; theme=dark; NetworkProbeLimit=0.001"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Upgrade-Insecure-Requests", "1"),
    ("X-Bar", "foo1"),
    ("X-Bar", "foo2"),
];

fn benchmark_headers_from_pairs(c: &mut Criterion) {
    c.bench_function("headers_from_pairs", |b| {
        b.iter(|| black_box(HttpHeaders::from_pairs(black_box(BROWSER_HEADERS.iter().copied())).unwrap()))
    });
}

fn benchmark_header_lookup(c: &mut Criterion) {
    let headers = HttpHeaders::from_pairs(BROWSER_HEADERS.iter().copied()).unwrap();
    c.bench_function("headers_all_values", |b| {
        b.iter(|| black_box(headers.all_values(black_box("x-bar"))))
    });
    c.bench_function("headers_has_token", |b| {
        b.iter(|| black_box(headers.has_token(black_box("accept-encoding"), "br")))
    });
}

// Validation and the restricted-name check run on every build.
fn benchmark_request_build(c: &mut Criterion) {
    c.bench_function("request_build", |b| {
        b.iter(|| {
            let request = HttpRequest::builder()
                .uri("https://example.com/search?q=pulsenet")
                .headers(BROWSER_HEADERS.iter().copied())
                .build()
                .unwrap();
            black_box(request)
        })
    });
}

criterion_group!(benches, benchmark_headers_from_pairs, benchmark_header_lookup, benchmark_request_build);
criterion_main!(benches);
