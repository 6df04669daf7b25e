//! Market order records parsed from CREST order collections.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of the book an order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Sell,
    Buy,
}

/// One resting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub price: f64,
    /// Remaining volume.
    pub volume: u64,
    /// Smallest fill the order accepts.
    pub min_volume: u64,
    pub issued: DateTime<Utc>,
    pub side: Side,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    price: f64,
    volume: u64,
    #[serde(default = "default_min_volume")]
    min_volume: u64,
    issued: String,
    buy: bool,
}

fn default_min_volume() -> u64 {
    1
}

impl OrderRecord {
    /// Parse one item of a market order collection.
    pub fn from_item(item: &Value) -> Result<Self, String> {
        let raw: RawOrder = serde_json::from_value(item.clone()).map_err(|e| e.to_string())?;
        Ok(Self {
            price: raw.price,
            volume: raw.volume,
            min_volume: raw.min_volume,
            issued: parse_timestamp(&raw.issued)?,
            side: if raw.buy { Side::Buy } else { Side::Sell },
        })
    }
}

/// CREST timestamps carry no offset (`2016-03-01T11:32:05`) and are UTC.
/// RFC 3339 values are accepted too.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("bad timestamp {raw:?}: {e}"))
}

/// Orders of one (item, region) pair split by side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub sell: Vec<OrderRecord>,
    pub buy: Vec<OrderRecord>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, order: OrderRecord) {
        match order.side {
            Side::Sell => self.sell.push(order),
            Side::Buy => self.buy.push(order),
        }
    }

    /// Build from collection items. Malformed items are skipped and counted.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a Value>) -> (Self, usize) {
        let mut book = Self::new();
        let mut skipped = 0;
        for item in items {
            match OrderRecord::from_item(item) {
                Ok(order) => book.push(order),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed order");
                    skipped += 1;
                }
            }
        }
        (book, skipped)
    }

    pub fn side(&self, side: Side) -> &[OrderRecord] {
        match side {
            Side::Sell => &self.sell,
            Side::Buy => &self.buy,
        }
    }

    pub fn len(&self) -> usize {
        self.sell.len() + self.buy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sell.is_empty() && self.buy.is_empty()
    }
}
