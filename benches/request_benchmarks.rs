//! Request path benchmarks
//!
//! Request line parsing, key normalization and artifact naming run on every
//! request before any I/O.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stashproxy::cache::artifact_file_name;
use stashproxy::{parse_request_line, CanonicalUrl};

fn bench_request_line_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_line_parsing");

    group.bench_function("get_absolute_form", |b| {
        b.iter(|| parse_request_line(black_box("GET http://example.com/a.html HTTP/1.0\r\n")).unwrap())
    });

    group.bench_function("connect_authority", |b| {
        b.iter(|| {
            let request = parse_request_line(black_box("CONNECT example.com:443 HTTP/1.1\r\n")).unwrap();
            request.connect_target().unwrap()
        })
    });

    group.finish();
}

fn bench_canonical_url(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonical_url");

    group.bench_function("scheme_less", |b| {
        b.iter(|| CanonicalUrl::new(black_box("example.com/path/to/page.html")))
    });

    let long_query = format!("http://example.com/search?q={}", "term+".repeat(200));
    group.bench_function("long_query", |b| {
        b.iter(|| CanonicalUrl::new(black_box(&long_query)))
    });

    group.finish();
}

fn bench_artifact_naming(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_naming");

    let page = CanonicalUrl::new("http://example.com/docs/getting-started/index.html");
    group.bench_function("html_page", |b| b.iter(|| artifact_file_name(black_box(&page))));

    let image = CanonicalUrl::new("http://cdn.example.com/img/logo%20large.png?v=42");
    group.bench_function("image_with_query", |b| {
        b.iter(|| artifact_file_name(black_box(&image)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_line_parsing,
    bench_canonical_url,
    bench_artifact_naming
);
criterion_main!(benches);
