//! Criterion benchmarks for the estimation hot paths.
//!
//! Benchmarks:
//! 1. Single-side realistic price estimation over growing books
//! 2. Order book assembly from raw collection items
//! 3. Weekly averages over a long history

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

use crest_market::{estimate_side, weekly_averages, HistoryRow, OrderBook, OrderRecord, Side};

// ── Helpers ──────────────────────────────────────────────────────────

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 3, 10, 12, 0, 0).unwrap()
}

fn make_orders(n: usize, side: Side) -> Vec<OrderRecord> {
    (0..n)
        .map(|i| OrderRecord {
            price: 5.0 + (i as f64 * 0.37).sin().abs() * 2.0,
            volume: 100 + (i as u64 * 7919) % 50_000,
            min_volume: 1 + (i as u64 % 3),
            issued: now() - Duration::seconds((i as i64 * 613) % 7_776_000),
            side,
        })
        .collect()
}

fn make_items(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "price": 5.0 + (i % 100) as f64 * 0.01,
                "volume": 1000 + i,
                "minVolume": 1,
                "issued": "2016-03-09T08:15:00",
                "buy": i % 2 == 0
            })
        })
        .collect()
}

fn make_history(days: i64) -> Vec<HistoryRow> {
    let today = NaiveDate::from_ymd_opt(2016, 3, 10).unwrap();
    (1..=days)
        .map(|back| HistoryRow {
            date: today - Duration::days(back),
            volume: 1_000_000 + (back as u64 * 31) % 10_000,
            order_count: 500 + (back as u64 % 50),
            avg_price: 5.1,
            low_price: 4.9,
            high_price: 5.3,
        })
        .collect()
}

// ── 1. Estimation ────────────────────────────────────────────────────

fn bench_estimate_side(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_side");
    for n in [10usize, 100, 1_000, 10_000] {
        let sells = make_orders(n, Side::Sell);
        let avg_volume = 50_000.0 * n as f64 / 10.0;
        group.bench_with_input(BenchmarkId::from_parameter(n), &sells, |b, orders| {
            b.iter(|| estimate_side(black_box(orders), Side::Sell, avg_volume, now()))
        });
    }
    group.finish();
}

// ── 2. Book assembly ─────────────────────────────────────────────────

fn bench_order_book(c: &mut Criterion) {
    let items = make_items(5_000);
    c.bench_function("order_book_from_items_5000", |b| {
        b.iter(|| OrderBook::from_items(black_box(&items)))
    });
}

// ── 3. History ───────────────────────────────────────────────────────

fn bench_weekly_averages(c: &mut Criterion) {
    let rows = make_history(400);
    let today = NaiveDate::from_ymd_opt(2016, 3, 10).unwrap();
    c.bench_function("weekly_averages_400_days", |b| {
        b.iter(|| weekly_averages(black_box(&rows), today))
    });
}

criterion_group!(benches, bench_estimate_side, bench_order_book, bench_weekly_averages);
criterion_main!(benches);
