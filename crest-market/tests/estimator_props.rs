//! Property tests for the realistic price estimator.
//!
//! Uses proptest to verify:
//! 1. A side with no eligible orders yields no estimate
//! 2. The realistic price lies within the eligible price range
//! 3. Liquidity covers the best order and never exceeds eligible volume
//! 4. Order ages are never negative when every order predates `now`
//! 5. Weekly averages ignore rows outside the trailing week
//! 6. Estimation is pure: the same snapshot always gives the same estimate

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use proptest::prelude::*;

use crest_market::{
    estimate, estimate_side, weekly_averages, HistoryRow, OrderBook, OrderRecord, Side,
    WeeklyAverages,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 3, 10, 12, 0, 0).unwrap()
}

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_order(side: Side) -> impl Strategy<Value = OrderRecord> {
    (1u32..100_000, 1u64..10_000, 1u64..50, 0i64..2_000_000).prop_map(
        move |(cents, volume, min_volume, age)| OrderRecord {
            price: cents as f64 / 100.0,
            volume,
            min_volume,
            issued: now() - Duration::seconds(age),
            side,
        },
    )
}

fn arb_side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Sell), Just(Side::Buy)]
}

fn arb_book() -> impl Strategy<Value = (Side, Vec<OrderRecord>, f64)> {
    arb_side().prop_flat_map(|side| {
        (
            Just(side),
            prop::collection::vec(arb_order(side), 0..40),
            0.0f64..50_000.0,
        )
    })
}

fn eligible(orders: &[OrderRecord], avg_volume: f64) -> Vec<&OrderRecord> {
    orders
        .iter()
        .filter(|o| o.min_volume as f64 <= avg_volume.max(1.0))
        .collect()
}

// ── 1. Empty sides ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn no_eligible_orders_means_no_estimate(
        (side, orders, avg_volume) in arb_book(),
    ) {
        let result = estimate_side(&orders, side, avg_volume, now());
        prop_assert_eq!(result.is_none(), eligible(&orders, avg_volume).is_empty());
    }

    /// Every order demands more than the cap allows.
    #[test]
    fn oversized_minimums_are_filtered(
        side in arb_side(),
        avg_volume in 0.0f64..100.0,
        count in 1usize..10,
    ) {
        let orders: Vec<OrderRecord> = (0..count)
            .map(|i| OrderRecord {
                price: 10.0 + i as f64,
                volume: 1_000,
                min_volume: 101,
                issued: now(),
                side,
            })
            .collect();
        prop_assert!(estimate_side(&orders, side, avg_volume, now()).is_none());
    }
}

// ── 2-4. Estimate bounds ─────────────────────────────────────────────

proptest! {
    #[test]
    fn realistic_price_within_eligible_range(
        (side, orders, avg_volume) in arb_book(),
    ) {
        let pool = eligible(&orders, avg_volume);
        prop_assume!(!pool.is_empty());
        let est = estimate_side(&orders, side, avg_volume, now()).unwrap();
        let lo = pool.iter().map(|o| o.price).fold(f64::INFINITY, f64::min);
        let hi = pool.iter().map(|o| o.price).fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(est.realistic_price >= lo - 1e-9);
        prop_assert!(est.realistic_price <= hi + 1e-9);
    }

    #[test]
    fn liquidity_covers_best_order(
        (side, orders, avg_volume) in arb_book(),
    ) {
        let pool = eligible(&orders, avg_volume);
        prop_assume!(!pool.is_empty());
        let est = estimate_side(&orders, side, avg_volume, now()).unwrap();
        let best = match side {
            Side::Sell => pool.iter().map(|o| o.price).fold(f64::INFINITY, f64::min),
            Side::Buy => pool.iter().map(|o| o.price).fold(f64::NEG_INFINITY, f64::max),
        };
        let best_volume: u64 = pool.iter().filter(|o| o.price == best).map(|o| o.volume).sum();
        let total: u64 = pool.iter().map(|o| o.volume).sum();
        prop_assert!(est.liquidity >= best_volume);
        prop_assert!(est.liquidity <= total);
    }

    #[test]
    fn order_age_is_never_negative(
        (side, orders, avg_volume) in arb_book(),
    ) {
        if let Some(est) = estimate_side(&orders, side, avg_volume, now()) {
            prop_assert!(est.avg_order_age >= 0);
            let oldest = orders.iter().map(|o| (now() - o.issued).num_seconds()).max().unwrap_or(0);
            prop_assert!(est.avg_order_age <= oldest);
        }
    }
}

// ── 5. Weekly window ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn rows_outside_the_week_are_ignored(
        inside in prop::collection::vec((1i64..=7, 0u64..100_000, 0u64..1_000), 0..7),
        outside in prop::collection::vec((prop_oneof![-30i64..=0, 8i64..40], 0u64..100_000, 0u64..1_000), 0..10),
    ) {
        let today = NaiveDate::from_ymd_opt(2016, 3, 10).unwrap();
        let row = |(back, volume, order_count): (i64, u64, u64)| HistoryRow {
            date: today - Duration::days(back),
            volume,
            order_count,
            avg_price: 1.0,
            low_price: 1.0,
            high_price: 1.0,
        };
        let inside_rows: Vec<HistoryRow> = inside.iter().copied().map(row).collect();
        let mut all_rows = inside_rows.clone();
        all_rows.extend(outside.iter().copied().map(row));

        let expected = weekly_averages(&inside_rows, today);
        let actual = weekly_averages(&all_rows, today);
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(actual.last_update, today);
        let volume: u64 = inside.iter().map(|(_, v, _)| v).sum();
        prop_assert!((actual.avg_volume - volume as f64 / 7.0).abs() < 1e-6);
    }
}

// ── 6. Purity ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn estimation_is_idempotent(
        sells in prop::collection::vec(arb_order(Side::Sell), 0..20),
        buys in prop::collection::vec(arb_order(Side::Buy), 0..20),
        avg_volume in 0.0f64..50_000.0,
    ) {
        let mut book = OrderBook::new();
        for order in sells.into_iter().chain(buys) {
            book.push(order);
        }
        let averages = WeeklyAverages {
            avg_volume,
            avg_transactions: 3.0,
            last_update: now().date_naive(),
        };
        let first = estimate(34, 10000002, &book, &averages, now());
        let second = estimate(34, 10000002, &book, &averages, now());
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.sell.is_none(), book.sell.is_empty() || eligible(&book.sell, avg_volume).is_empty());
        prop_assert_eq!(first.buy.is_none(), book.buy.is_empty() || eligible(&book.buy, avg_volume).is_empty());
    }
}
