//! CSV export of stored price estimates.

use anyhow::{Context, Result};
use std::path::Path;

use crate::estimator::{PriceEstimate, SideEstimate, ESTIMATES_TABLE};
use crate::names::{NameKind, NameLookup};
use crate::persistence::PersistenceSink;

/// All stored estimates, ordered by region then item.
pub fn latest_estimates(sink: &dyn PersistenceSink) -> Result<Vec<PriceEstimate>> {
    let mut estimates = sink
        .rows(ESTIMATES_TABLE)?
        .iter()
        .map(PriceEstimate::from_row)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to decode stored estimates")?;
    estimates.sort_by_key(|e| (e.region_id, e.item_id));
    Ok(estimates)
}

/// Export estimates as CSV.
///
/// Columns: region_id, region, item_id, item, date, sell_price,
/// sell_liquidity, sell_avg_order_age, buy_price, buy_liquidity,
/// buy_avg_order_age, avg_volume, avg_transactions, last_history_update.
/// Absent sides leave their columns empty. Names come from `names` when it
/// already knows them and are left empty otherwise.
pub fn export_estimates_csv(estimates: &[PriceEstimate], names: Option<&NameLookup>) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "region_id",
        "region",
        "item_id",
        "item",
        "date",
        "sell_price",
        "sell_liquidity",
        "sell_avg_order_age",
        "buy_price",
        "buy_liquidity",
        "buy_avg_order_age",
        "avg_volume",
        "avg_transactions",
        "last_history_update",
    ])?;

    let name = |kind: NameKind, id: u64| -> String {
        names
            .and_then(|n| n.cached(kind, id))
            .unwrap_or_default()
            .to_string()
    };

    for e in estimates {
        let [sell_price, sell_liquidity, sell_age] = side_columns(e.sell.as_ref());
        let [buy_price, buy_liquidity, buy_age] = side_columns(e.buy.as_ref());
        wtr.write_record([
            &e.region_id.to_string(),
            &name(NameKind::Region, e.region_id),
            &e.item_id.to_string(),
            &name(NameKind::Item, e.item_id),
            &e.date.to_string(),
            &sell_price,
            &sell_liquidity,
            &sell_age,
            &buy_price,
            &buy_liquidity,
            &buy_age,
            &format!("{:.2}", e.avg_volume),
            &format!("{:.2}", e.avg_transactions),
            &e.last_history_update.to_string(),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

fn side_columns(side: Option<&SideEstimate>) -> [String; 3] {
    match side {
        Some(s) => [
            format!("{:.2}", s.realistic_price),
            s.liquidity.to_string(),
            s.avg_order_age.to_string(),
        ],
        None => [String::new(), String::new(), String::new()],
    }
}

/// Write the CSV export to `path`, creating parent directories.
pub fn save_estimates_csv(estimates: &[PriceEstimate], names: Option<&NameLookup>, path: &Path) -> Result<()> {
    let csv = export_estimates_csv(estimates, names)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, csv).with_context(|| format!("failed to write {}", path.display()))
}
