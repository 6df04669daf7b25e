//! Realistic price estimation from an order-book snapshot.
//!
//! Per side (sell ascending by price, buy descending):
//! 1. Skip orders whose `min_volume` exceeds `max(avg_volume, 1)`.
//! 2. Accumulate volume, volume-weighted price and volume-weighted age until
//!    the volume covers 5% of the trailing-week average volume.
//! 3. Realistic price and average age divide by the volume (1 when zero).
//! 4. Liquidity sums eligible volume priced within 5% of the realistic price,
//!    scanning in sort order and stopping at the first order past the band.
//!
//! A side with no eligible orders is `None`, never zeroed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::history::WeeklyAverages;
use crate::orders::{OrderBook, OrderRecord, Side};
use crate::persistence::{column, optional_column, PersistenceOperation, Row, StoreError};

/// Share of weekly volume whose orders define the realistic price.
pub const REALISTIC_VOLUME_SHARE: f64 = 0.05;
/// Relative distance from the realistic price counted as liquidity.
pub const LIQUIDITY_BAND: f64 = 0.05;

pub const ESTIMATES_TABLE: &str = "price_estimates";

/// Estimate for one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SideEstimate {
    pub realistic_price: f64,
    /// Volume within the liquidity band.
    pub liquidity: u64,
    /// Volume-weighted order age in whole seconds.
    pub avg_order_age: i64,
}

/// Derived price statistics for an (item, region) pair on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub item_id: u64,
    pub region_id: u64,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell: Option<SideEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy: Option<SideEstimate>,
    pub avg_volume: f64,
    pub avg_transactions: f64,
    pub last_history_update: NaiveDate,
}

impl PriceEstimate {
    /// Upsert keyed by (item_id, region_id). Absent sides write nulls so a
    /// side priced by an earlier run does not survive into this one.
    pub fn to_operation(&self) -> PersistenceOperation {
        let mut key = BTreeMap::new();
        key.insert("item_id".to_string(), self.item_id.into());
        key.insert("region_id".to_string(), self.region_id.into());

        let mut values = BTreeMap::new();
        values.insert("date".to_string(), self.date.to_string().into());
        for (prefix, side) in [("sell", &self.sell), ("buy", &self.buy)] {
            let (price, liquidity, age) = match side {
                Some(s) => (s.realistic_price.into(), s.liquidity.into(), s.avg_order_age.into()),
                None => (Value::Null, Value::Null, Value::Null),
            };
            values.insert(format!("{prefix}_price"), price);
            values.insert(format!("{prefix}_liquidity"), liquidity);
            values.insert(format!("{prefix}_avg_order_age"), age);
        }
        values.insert("avg_volume".to_string(), self.avg_volume.into());
        values.insert("avg_transactions".to_string(), self.avg_transactions.into());
        values.insert(
            "last_history_update".to_string(),
            self.last_history_update.to_string().into(),
        );

        PersistenceOperation::Upsert {
            table: ESTIMATES_TABLE.to_string(),
            key,
            values,
        }
    }

    /// Rebuild an estimate from a stored `price_estimates` row.
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        let side = |prefix: &str| -> Result<Option<SideEstimate>, StoreError> {
            let Some(realistic_price) = optional_column(row, ESTIMATES_TABLE, &format!("{prefix}_price"))? else {
                return Ok(None);
            };
            Ok(Some(SideEstimate {
                realistic_price,
                liquidity: column(row, ESTIMATES_TABLE, &format!("{prefix}_liquidity"))?,
                avg_order_age: column(row, ESTIMATES_TABLE, &format!("{prefix}_avg_order_age"))?,
            }))
        };
        Ok(Self {
            item_id: column(row, ESTIMATES_TABLE, "item_id")?,
            region_id: column(row, ESTIMATES_TABLE, "region_id")?,
            date: column(row, ESTIMATES_TABLE, "date")?,
            sell: side("sell")?,
            buy: side("buy")?,
            avg_volume: column(row, ESTIMATES_TABLE, "avg_volume")?,
            avg_transactions: column(row, ESTIMATES_TABLE, "avg_transactions")?,
            last_history_update: column(row, ESTIMATES_TABLE, "last_history_update")?,
        })
    }
}

/// Pluggable estimation strategy, chosen when the processor is built.
pub trait PriceModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(
        &self,
        item_id: u64,
        region_id: u64,
        book: &OrderBook,
        averages: &WeeklyAverages,
        now: DateTime<Utc>,
    ) -> PriceEstimate;
}

/// The 5%-of-weekly-volume realistic price model.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealisticPrice;

impl PriceModel for RealisticPrice {
    fn name(&self) -> &'static str {
        "realistic"
    }

    fn estimate(
        &self,
        item_id: u64,
        region_id: u64,
        book: &OrderBook,
        averages: &WeeklyAverages,
        now: DateTime<Utc>,
    ) -> PriceEstimate {
        estimate(item_id, region_id, book, averages, now)
    }
}

/// Estimate both sides and merge them with the weekly averages.
pub fn estimate(
    item_id: u64,
    region_id: u64,
    book: &OrderBook,
    averages: &WeeklyAverages,
    now: DateTime<Utc>,
) -> PriceEstimate {
    PriceEstimate {
        item_id,
        region_id,
        date: now.date_naive(),
        sell: estimate_side(&book.sell, Side::Sell, averages.avg_volume, now),
        buy: estimate_side(&book.buy, Side::Buy, averages.avg_volume, now),
        avg_volume: averages.avg_volume,
        avg_transactions: averages.avg_transactions,
        last_history_update: averages.last_update,
    }
}

/// Estimate one side. `None` when no order passes the min-volume filter.
pub fn estimate_side(
    orders: &[OrderRecord],
    side: Side,
    avg_volume: f64,
    now: DateTime<Utc>,
) -> Option<SideEstimate> {
    let min_volume_cap = avg_volume.max(1.0);
    let mut eligible: Vec<&OrderRecord> = orders
        .iter()
        .filter(|o| (o.min_volume as f64) <= min_volume_cap)
        .collect();
    if eligible.is_empty() {
        return None;
    }
    match side {
        Side::Sell => eligible.sort_by(|a, b| a.price.total_cmp(&b.price)),
        Side::Buy => eligible.sort_by(|a, b| b.price.total_cmp(&a.price)),
    }

    let target = REALISTIC_VOLUME_SHARE * avg_volume;
    let mut volume_sum = 0u64;
    let mut price_sum = 0.0;
    let mut age_sum = 0.0;
    for order in &eligible {
        let age = (now - order.issued).num_seconds() as f64;
        volume_sum = volume_sum.saturating_add(order.volume);
        price_sum += order.volume as f64 * order.price;
        age_sum += order.volume as f64 * age;
        if volume_sum as f64 >= target {
            break;
        }
    }

    let divisor = if volume_sum == 0 { 1.0 } else { volume_sum as f64 };
    let realistic_price = price_sum / divisor;
    let avg_order_age = (age_sum / divisor).trunc() as i64;

    let mut liquidity = 0u64;
    for order in &eligible {
        let within = match side {
            Side::Sell => order.price <= realistic_price * (1.0 + LIQUIDITY_BAND),
            Side::Buy => order.price >= realistic_price * (1.0 - LIQUIDITY_BAND),
        };
        if !within {
            break;
        }
        liquidity = liquidity.saturating_add(order.volume);
    }

    Some(SideEstimate {
        realistic_price,
        liquidity,
        avg_order_age,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 3, 10, 12, 0, 0).unwrap()
    }

    fn order(side: Side, price: f64, volume: u64, min_volume: u64, age_secs: i64) -> OrderRecord {
        OrderRecord {
            price,
            volume,
            min_volume,
            issued: now() - Duration::seconds(age_secs),
            side,
        }
    }

    fn averages(avg_volume: f64) -> WeeklyAverages {
        WeeklyAverages {
            avg_volume,
            avg_transactions: 3.0,
            last_update: now().date_naive(),
        }
    }

    #[test]
    fn liquidity_example() {
        let sells = vec![
            order(Side::Sell, 12.0, 100, 1, 10),
            order(Side::Sell, 10.3, 3, 1, 10),
            order(Side::Sell, 10.0, 5, 1, 10),
        ];
        let est = estimate_side(&sells, Side::Sell, 100.0, now()).unwrap();
        assert_eq!(est.realistic_price, 10.0);
        assert_eq!(est.liquidity, 8);
        assert_eq!(est.avg_order_age, 10);
    }

    #[test]
    fn volume_weighted_until_share_reached() {
        // 5% of 200 = 10 units: 4 @ 10.0 then 8 @ 11.0 crosses the target.
        let sells = vec![
            order(Side::Sell, 10.0, 4, 1, 100),
            order(Side::Sell, 11.0, 8, 1, 200),
            order(Side::Sell, 50.0, 1000, 1, 0),
        ];
        let est = estimate_side(&sells, Side::Sell, 200.0, now()).unwrap();
        let expected = (4.0 * 10.0 + 8.0 * 11.0) / 12.0;
        assert!((est.realistic_price - expected).abs() < 1e-12);
        // (4*100 + 8*200) / 12 = 166.67, truncated
        assert_eq!(est.avg_order_age, 166);
    }

    #[test]
    fn buy_side_sorts_descending() {
        let buys = vec![
            order(Side::Buy, 8.0, 10, 1, 0),
            order(Side::Buy, 9.8, 10, 1, 0),
            order(Side::Buy, 9.0, 10, 1, 0),
        ];
        let est = estimate_side(&buys, Side::Buy, 100.0, now()).unwrap();
        assert_eq!(est.realistic_price, 9.8);
        // band is >= 9.31: 9.8 counts, 9.0 stops the scan
        assert_eq!(est.liquidity, 10);
    }

    #[test]
    fn min_volume_filter_skips_unfillable_orders() {
        let sells = vec![
            order(Side::Sell, 1.0, 500, 50, 0),
            order(Side::Sell, 2.0, 10, 1, 0),
        ];
        let est = estimate_side(&sells, Side::Sell, 20.0, now()).unwrap();
        assert_eq!(est.realistic_price, 2.0);
        assert_eq!(est.liquidity, 10);
    }

    #[test]
    fn min_volume_cap_is_at_least_one() {
        let sells = vec![order(Side::Sell, 3.0, 10, 1, 0)];
        assert!(estimate_side(&sells, Side::Sell, 0.0, now()).is_some());
        let strict = vec![order(Side::Sell, 3.0, 10, 2, 0)];
        assert!(estimate_side(&strict, Side::Sell, 0.0, now()).is_none());
    }

    #[test]
    fn zero_volume_uses_unit_divisor() {
        let sells = vec![order(Side::Sell, 7.0, 0, 1, 0)];
        let est = estimate_side(&sells, Side::Sell, 100.0, now()).unwrap();
        assert_eq!(est.realistic_price, 0.0);
        assert_eq!(est.liquidity, 0);
    }

    #[test]
    fn empty_side_is_absent_not_zero() {
        let mut book = OrderBook::new();
        book.push(order(Side::Sell, 10.0, 5, 1, 0));
        let est = estimate(34, 10000002, &book, &averages(100.0), now());
        assert!(est.sell.is_some());
        assert!(est.buy.is_none());

        let json = serde_json::to_value(&est).unwrap();
        assert!(json.get("buy").is_none());
        assert!(json.get("sell").is_some());

        let PersistenceOperation::Upsert { values, .. } = est.to_operation() else {
            panic!("estimates are upserts");
        };
        assert!(values["sell_price"].is_number());
        assert_eq!(values["buy_price"], Value::Null);
        assert_eq!(values["buy_liquidity"], Value::Null);
        assert_eq!(values["buy_avg_order_age"], Value::Null);
    }

    #[test]
    fn absent_side_replaces_earlier_side() {
        use crate::persistence::{MemoryStore, PersistenceSink};

        let mut full = OrderBook::new();
        full.push(order(Side::Sell, 10.0, 5, 1, 5));
        let first = estimate(34, 1, &full, &averages(100.0), now());
        let later = now() + Duration::days(1);
        let second = estimate(34, 1, &OrderBook::new(), &averages(100.0), later);
        assert!(first.sell.is_some() && second.sell.is_none());

        let store = MemoryStore::new();
        store.commit(&[first.to_operation()]).unwrap();
        store.commit(&[second.to_operation()]).unwrap();

        let rows = store.rows(ESTIMATES_TABLE).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(PriceEstimate::from_row(&rows[0]).unwrap(), second);
    }

    #[test]
    fn huge_volumes_saturate_instead_of_overflowing() {
        let sells = vec![
            order(Side::Sell, 1.0, u64::MAX, 1, 0),
            order(Side::Sell, 1.0, u64::MAX, 1, 0),
        ];
        let est = estimate_side(&sells, Side::Sell, f64::MAX, now()).unwrap();
        assert_eq!(est.liquidity, u64::MAX);
    }

    #[test]
    fn estimate_survives_row_round_trip() {
        let mut book = OrderBook::new();
        book.push(order(Side::Buy, 9.0, 50, 1, 30));
        let est = estimate(34, 10000002, &book, &averages(100.0), now());
        let PersistenceOperation::Upsert { key, values, .. } = est.to_operation() else {
            panic!("estimates are upserts");
        };
        let mut row = key;
        row.extend(values);
        assert_eq!(PriceEstimate::from_row(&row).unwrap(), est);
    }

    #[test]
    fn estimate_carries_averages() {
        let est = RealisticPrice.estimate(34, 1, &OrderBook::new(), &averages(70.0), now());
        assert_eq!(est.avg_volume, 70.0);
        assert_eq!(est.avg_transactions, 3.0);
        assert_eq!(est.date, now().date_naive());
        assert!(est.sell.is_none() && est.buy.is_none());
    }
}
