//! Performance benchmarks for request handling.
//!
//! These benchmarks measure the hot paths behind every viewer poll:
//! - Request parsing and key checking
//! - Snapshot serialization
//! - Stats updates from the render callback

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::access::AccessKey;
use daemon::router::RequestRouter;
use daemon::stats::{StatsStore, UnitProgress};

/// Builds a router over a store with a realistic log tail.
fn populated_router() -> (RequestRouter<StatsStore>, String) {
    let stats = StatsStore::new();
    stats.clear_log();
    for frame in 1..=400 {
        stats.update(UnitProgress::new(frame, 1000, Duration::from_millis(33)));
    }

    let key = AccessKey::generate();
    let target = key.as_str().to_string();
    (RequestRouter::new(stats, key), target)
}

/// Benchmark routing of the three response kinds.
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let (router, key) = populated_router();

    let stats_request = format!("GET /stats?key={} HTTP/1.1\r\nHost: h\r\n\r\n", key);
    group.throughput(Throughput::Bytes(stats_request.len() as u64));
    group.bench_function("stats_json", |b| {
        b.iter(|| router.route(black_box(stats_request.as_bytes())).to_bytes());
    });

    let page_request = format!("GET /?key={} HTTP/1.1\r\nHost: h\r\n\r\n", key);
    group.bench_function("html_page", |b| {
        b.iter(|| router.route(black_box(page_request.as_bytes())).to_bytes());
    });

    let forbidden = b"GET /stats?key=wrongwrongwrong0 HTTP/1.1\r\n\r\n";
    group.bench_function("forbidden", |b| {
        b.iter(|| router.route(black_box(forbidden)).to_bytes());
    });

    group.finish();
}

/// Benchmark the render callback path.
fn bench_stats_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("stats_update");
    let stats = StatsStore::new();

    group.bench_function("update", |b| {
        let mut frame = 0;
        b.iter(|| {
            frame = (frame + 1) % 10_000;
            stats.update(black_box(UnitProgress::new(
                frame,
                10_000,
                Duration::from_millis(33),
            )));
        });
    });

    group.bench_function("read", |b| {
        b.iter(|| black_box(stats.read()));
    });

    group.finish();
}

criterion_group!(benches, bench_routing, bench_stats_update);
criterion_main!(benches);
