//! Market history rows and trailing-week averages.
//!
//! Weekly averages are the mean `volume` and mean `orderCount` over the seven
//! days before the current day. Days without a row count as zero.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::orders::parse_timestamp;
use crate::persistence::{column, key_of, PersistenceOperation, Row, StoreError};

/// Length of the averaging window in days.
pub const WINDOW_DAYS: i64 = 7;

pub const AVERAGES_TABLE: &str = "history_averages";

/// One day of market history for an (item, region) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub date: NaiveDate,
    pub volume: u64,
    pub order_count: u64,
    pub avg_price: f64,
    pub low_price: f64,
    pub high_price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRow {
    date: String,
    volume: u64,
    order_count: u64,
    #[serde(default)]
    avg_price: f64,
    #[serde(default)]
    low_price: f64,
    #[serde(default)]
    high_price: f64,
}

impl HistoryRow {
    pub fn from_item(item: &Value) -> Result<Self, String> {
        let raw: RawRow = serde_json::from_value(item.clone()).map_err(|e| e.to_string())?;
        let date = match NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => parse_timestamp(&raw.date)?.date_naive(),
        };
        Ok(Self {
            date,
            volume: raw.volume,
            order_count: raw.order_count,
            avg_price: raw.avg_price,
            low_price: raw.low_price,
            high_price: raw.high_price,
        })
    }

    /// Parse every item, skipping malformed rows.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a Value>) -> Vec<Self> {
        items
            .into_iter()
            .filter_map(|item| match Self::from_item(item) {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed history row");
                    None
                }
            })
            .collect()
    }
}

/// Trailing-week averages for an (item, region) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeeklyAverages {
    pub avg_volume: f64,
    pub avg_transactions: f64,
    /// Day the averages were computed on.
    pub last_update: NaiveDate,
}

impl WeeklyAverages {
    /// Averages of a pair with no recorded trades.
    pub fn empty(last_update: NaiveDate) -> Self {
        Self {
            avg_volume: 0.0,
            avg_transactions: 0.0,
            last_update,
        }
    }

    /// Averages computed before `today` must be refreshed.
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.last_update < today
    }

    pub fn key(item_id: u64, region_id: u64) -> BTreeMap<String, Value> {
        key_of([("item_id", item_id.into()), ("region_id", region_id.into())])
    }

    pub fn to_operation(&self, item_id: u64, region_id: u64) -> PersistenceOperation {
        PersistenceOperation::Upsert {
            table: AVERAGES_TABLE.to_string(),
            key: Self::key(item_id, region_id),
            values: key_of([
                ("avg_volume", self.avg_volume.into()),
                ("avg_transactions", self.avg_transactions.into()),
                ("last_update", self.last_update.to_string().into()),
            ]),
        }
    }

    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            avg_volume: column(row, AVERAGES_TABLE, "avg_volume")?,
            avg_transactions: column(row, AVERAGES_TABLE, "avg_transactions")?,
            last_update: column(row, AVERAGES_TABLE, "last_update")?,
        })
    }
}

/// Average the rows dated in `[today - 7, today - 1]`.
pub fn weekly_averages(rows: &[HistoryRow], today: NaiveDate) -> WeeklyAverages {
    let start = today - Duration::days(WINDOW_DAYS);
    let (volume, orders) = rows
        .iter()
        .filter(|r| r.date >= start && r.date < today)
        .fold((0u64, 0u64), |(v, o), r| {
            (v.saturating_add(r.volume), o.saturating_add(r.order_count))
        });
    WeeklyAverages {
        avg_volume: volume as f64 / WINDOW_DAYS as f64,
        avg_transactions: orders as f64 / WINDOW_DAYS as f64,
        last_update: today,
    }
}

/// Source of stored weekly averages.
pub trait HistoryProvider: Send + Sync {
    fn weekly_averages(&self, item_id: u64, region_id: u64) -> Result<Option<WeeklyAverages>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, d).unwrap()
    }

    fn row(date: NaiveDate, volume: u64, order_count: u64) -> HistoryRow {
        HistoryRow {
            date,
            volume,
            order_count,
            avg_price: 1.0,
            low_price: 1.0,
            high_price: 1.0,
        }
    }

    #[test]
    fn parses_crest_history_item() {
        let item = json!({
            "volume_str": "7000",
            "orderCount": 12,
            "lowPrice": 4.9,
            "highPrice": 5.3,
            "avgPrice": 5.1,
            "volume": 7000,
            "orderCount_str": "12",
            "date": "2016-03-01T00:00:00"
        });
        let r = HistoryRow::from_item(&item).unwrap();
        assert_eq!(r.date, day(1));
        assert_eq!(r.volume, 7000);
        assert_eq!(r.order_count, 12);
    }

    #[test]
    fn averages_use_previous_seven_days_only() {
        let today = day(10);
        let rows = vec![
            row(day(2), 1_000, 100), // outside window
            row(day(3), 70, 7),
            row(day(9), 70, 7),
            row(day(10), 5_000, 500), // today, excluded
        ];
        let avg = weekly_averages(&rows, today);
        assert_eq!(avg.avg_volume, 20.0);
        assert_eq!(avg.avg_transactions, 2.0);
        assert_eq!(avg.last_update, today);
    }

    #[test]
    fn missing_days_count_as_zero() {
        let avg = weekly_averages(&[row(day(9), 7, 7)], day(10));
        assert_eq!(avg.avg_volume, 1.0);
        assert_eq!(weekly_averages(&[], day(10)).avg_volume, 0.0);
    }

    #[test]
    fn huge_volumes_saturate() {
        let rows = vec![row(day(8), u64::MAX, u64::MAX), row(day(9), u64::MAX, 1)];
        let avg = weekly_averages(&rows, day(10));
        assert_eq!(avg.avg_volume, u64::MAX as f64 / 7.0);
        assert_eq!(avg.avg_transactions, u64::MAX as f64 / 7.0);
    }

    #[test]
    fn averages_round_trip_through_a_row() {
        let avg = weekly_averages(&[row(day(9), 70, 14)], day(10));
        let PersistenceOperation::Upsert { key, values, .. } = avg.to_operation(34, 10000002) else {
            panic!("averages are upserts");
        };
        let mut stored = key;
        stored.extend(values);
        assert_eq!(WeeklyAverages::from_row(&stored).unwrap(), avg);
    }

    #[test]
    fn staleness_is_by_calendar_day() {
        let avg = WeeklyAverages::empty(day(9));
        assert!(avg.is_stale(day(10)));
        assert!(!avg.is_stale(day(9)));
    }
}
