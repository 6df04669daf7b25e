//! Market processor: per-region history and price batches.
//!
//! For each region the processor first makes sure every configured item has
//! today's weekly averages, refreshing stale ones through a history batch.
//! It then fetches order books in one batch, estimates prices and buffers
//! upserts. The buffer is flushed whenever the flush interval has elapsed and
//! always at the end of every batch, including after an abort, so work
//! completed before an abort is never dropped.
//!
//! A `ServiceUnavailable` or `TooManyErrors` abort ends that region only; the
//! run continues with the next one.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crest_core::{BatchFetcher, BatchJob, Collection, CrestError, Envelope, Executor, Gatherer};

use crate::config::MarketConfig;
use crate::estimator::{PriceModel, RealisticPrice};
use crate::history::{weekly_averages, HistoryProvider, HistoryRow, WeeklyAverages};
use crate::names::NameLookup;
use crate::orders::OrderBook;
use crate::persistence::{OperationBuffer, PersistenceSink, StoreError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Crest(#[from] CrestError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Which batch a region outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    History,
    Prices,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::History => f.write_str("history"),
            RunKind::Prices => f.write_str("prices"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionStatus {
    Completed,
    Aborted { stage: RunKind, reason: String },
}

/// What happened to one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOutcome {
    pub region_id: u64,
    pub region_name: String,
    pub status: RegionStatus,
    pub estimates: usize,
    pub history_refreshed: usize,
    /// Items dropped because their pages could not be assembled.
    pub skipped: usize,
    pub fetched: usize,
    pub from_cache: usize,
    pub errors: usize,
    pub operations_committed: usize,
}

impl RegionOutcome {
    fn new(region_id: u64, region_name: String) -> Self {
        Self {
            region_id,
            region_name,
            status: RegionStatus::Completed,
            estimates: 0,
            history_refreshed: 0,
            skipped: 0,
            fetched: 0,
            from_cache: 0,
            errors: 0,
            operations_committed: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RegionStatus::Completed
    }
}

/// Result of a whole run across regions.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub kind: RunKind,
    pub regions: Vec<RegionOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.regions.iter().filter(|r| r.is_completed()).count()
    }

    pub fn aborted(&self) -> usize {
        self.regions.len() - self.completed()
    }

    pub fn estimates(&self) -> usize {
        self.regions.iter().map(|r| r.estimates).sum()
    }

    pub fn history_refreshed(&self) -> usize {
        self.regions.iter().map(|r| r.history_refreshed).sum()
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Drives history and price batches for configured items across regions.
pub struct MarketProcessor<S> {
    fetcher: BatchFetcher,
    gatherer: Gatherer,
    store: Arc<S>,
    model: Box<dyn PriceModel>,
    market: MarketConfig,
    names: NameLookup,
    clock: Clock,
}

impl<S: PersistenceSink + HistoryProvider> MarketProcessor<S> {
    pub fn new(executor: Executor, store: Arc<S>, market: MarketConfig) -> Self {
        let gatherer = Gatherer::new(executor.clone());
        let names = NameLookup::new(
            gatherer.clone(),
            market.regions_url(),
            market.types_url(),
            market.names_ttl(),
        );
        Self {
            fetcher: BatchFetcher::new(executor),
            gatherer,
            store,
            model: Box::new(RealisticPrice),
            market,
            names,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_model(mut self, model: Box<dyn PriceModel>) -> Self {
        self.model = model;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn names(&mut self) -> &mut NameLookup {
        &mut self.names
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Refresh stale history, then estimate prices, region by region.
    pub fn run_prices(&mut self, regions: &[u64]) -> Result<RunSummary, ProcessError> {
        self.run(RunKind::Prices, regions)
    }

    /// Recompute weekly averages for every configured item, region by region.
    pub fn refresh_history(&mut self, regions: &[u64]) -> Result<RunSummary, ProcessError> {
        self.run(RunKind::History, regions)
    }

    fn run(&mut self, kind: RunKind, regions: &[u64]) -> Result<RunSummary, ProcessError> {
        let started_at = (self.clock)();
        tracing::info!(%kind, regions = regions.len(), items = self.market.items.len(), model = self.model.name(), "starting run");

        let mut outcomes = Vec::with_capacity(regions.len());
        for &region_id in regions {
            let region_name = self.names.region(region_id);
            let outcome = self.process_region(kind, region_id, region_name)?;
            match &outcome.status {
                RegionStatus::Completed => tracing::info!(
                    region = %outcome.region_name,
                    estimates = outcome.estimates,
                    history = outcome.history_refreshed,
                    committed = outcome.operations_committed,
                    "region complete"
                ),
                RegionStatus::Aborted { stage, reason } => tracing::warn!(
                    region = %outcome.region_name,
                    %stage,
                    %reason,
                    committed = outcome.operations_committed,
                    "region aborted, continuing with next region"
                ),
            }
            outcomes.push(outcome);
        }

        let summary = RunSummary {
            kind,
            regions: outcomes,
            started_at,
            finished_at: (self.clock)(),
        };
        tracing::info!(
            %kind,
            completed = summary.completed(),
            aborted = summary.aborted(),
            estimates = summary.estimates(),
            "run complete"
        );
        Ok(summary)
    }

    fn process_region(
        &self,
        kind: RunKind,
        region_id: u64,
        region_name: String,
    ) -> Result<RegionOutcome, ProcessError> {
        let now = (self.clock)();
        let today = now.date_naive();
        let mut outcome = RegionOutcome::new(region_id, region_name);
        let mut buffer = OperationBuffer::new(self.market.flush_interval());

        let history_items = match kind {
            RunKind::History => self.market.items.clone(),
            RunKind::Prices => self.stale_items(region_id, today)?,
        };
        if !history_items.is_empty() {
            tracing::info!(region = %outcome.region_name, items = history_items.len(), "refreshing history");
            let abort = self.history_batch(region_id, &history_items, today, &mut buffer, &mut outcome)?;
            if let Some(reason) = abort {
                outcome.status = RegionStatus::Aborted {
                    stage: RunKind::History,
                    reason,
                };
                outcome.operations_committed = buffer.committed_ops();
                return Ok(outcome);
            }
        }

        if kind == RunKind::Prices && !self.market.items.is_empty() {
            let abort = self.price_batch(region_id, now, &mut buffer, &mut outcome)?;
            if let Some(reason) = abort {
                outcome.status = RegionStatus::Aborted {
                    stage: RunKind::Prices,
                    reason,
                };
            }
        }
        outcome.operations_committed = buffer.committed_ops();
        Ok(outcome)
    }

    fn stale_items(&self, region_id: u64, today: NaiveDate) -> Result<Vec<u64>, StoreError> {
        let mut stale = Vec::new();
        for &item_id in &self.market.items {
            let fresh = self
                .store
                .weekly_averages(item_id, region_id)?
                .is_some_and(|avg| !avg.is_stale(today));
            if !fresh {
                stale.push(item_id);
            }
        }
        Ok(stale)
    }

    fn history_batch(
        &self,
        region_id: u64,
        items: &[u64],
        today: NaiveDate,
        buffer: &mut OperationBuffer,
        outcome: &mut RegionOutcome,
    ) -> Result<Option<String>, ProcessError> {
        let urls: HashMap<String, u64> = items
            .iter()
            .map(|&item| (self.market.history_url(region_id, item), item))
            .collect();
        let representation = self.market.history_representation.as_deref();
        let store = self.store.as_ref();

        let mut refreshed = 0;
        let mut skipped = 0;
        let mut store_failure = None;
        let mut job = BatchJob::new(items.iter().map(|&item| self.market.history_url(region_id, item)), |env| {
            let Some(&item_id) = urls.get(&env.url) else {
                return Ok(());
            };
            let Some(values) = self.page_items(&env, representation, &mut skipped)? else {
                return Ok(());
            };
            let rows = HistoryRow::from_items(&values);
            let averages = weekly_averages(&rows, today);
            buffer.push(averages.to_operation(item_id, region_id));
            refreshed += 1;
            flush_due(buffer, store, &mut store_failure)
        });
        if let Some(repr) = representation {
            job = job.expecting(repr);
        }
        let result = self.fetcher.run(job);

        outcome.history_refreshed += refreshed;
        outcome.skipped += skipped;
        finish_batch(result, buffer, store, store_failure, outcome)
    }

    fn price_batch(
        &self,
        region_id: u64,
        now: DateTime<Utc>,
        buffer: &mut OperationBuffer,
        outcome: &mut RegionOutcome,
    ) -> Result<Option<String>, ProcessError> {
        let today = now.date_naive();
        let mut averages = HashMap::new();
        for &item_id in &self.market.items {
            let avg = self
                .store
                .weekly_averages(item_id, region_id)?
                .unwrap_or_else(|| WeeklyAverages::empty(today));
            averages.insert(item_id, avg);
        }
        let urls: HashMap<String, u64> = self
            .market
            .items
            .iter()
            .map(|&item| (self.market.orders_url(region_id, item), item))
            .collect();
        let representation = self.market.orders_representation.as_deref();
        let store = self.store.as_ref();

        let mut estimates = 0;
        let mut skipped = 0;
        let mut store_failure = None;
        let mut job = BatchJob::new(
            self.market.items.iter().map(|&item| self.market.orders_url(region_id, item)),
            |env| {
                let Some(&item_id) = urls.get(&env.url) else {
                    return Ok(());
                };
                let Some(values) = self.page_items(&env, representation, &mut skipped)? else {
                    return Ok(());
                };
                let (book, _) = OrderBook::from_items(&values);
                let avg = averages
                    .get(&item_id)
                    .copied()
                    .unwrap_or_else(|| WeeklyAverages::empty(today));
                let estimate = self.model.estimate(item_id, region_id, &book, &avg, now);
                buffer.push(estimate.to_operation());
                estimates += 1;
                flush_due(buffer, store, &mut store_failure)
            },
        );
        if let Some(repr) = representation {
            job = job.expecting(repr);
        }
        let result = self.fetcher.run(job);

        outcome.estimates += estimates;
        outcome.skipped += skipped;
        finish_batch(result, buffer, store, store_failure, outcome)
    }

    /// All items of a collection, following `next` links past the first page.
    ///
    /// Batch aborts propagate; other failures skip the item.
    fn page_items(
        &self,
        first: &Envelope,
        representation: Option<&str>,
        skipped: &mut usize,
    ) -> Result<Option<Vec<Value>>, CrestError> {
        let assembled = if first.has_next() {
            let mut collection = Collection::new();
            self.gatherer
                .continue_from(first, representation, None, None, &mut collection)
                .map(|()| collection.into_values())
        } else {
            first
                .items()
                .cloned()
                .ok_or_else(|| CrestError::protocol(&first.url, first.status, "page has no items array"))
        };
        match assembled {
            Ok(values) => Ok(Some(values)),
            Err(e) if e.is_batch_abort() => Err(e),
            Err(e) => {
                tracing::warn!(url = %first.url, error = %e, "skipping collection");
                *skipped += 1;
                Ok(None)
            }
        }
    }
}

fn flush_due(
    buffer: &mut OperationBuffer,
    store: &dyn PersistenceSink,
    failure: &mut Option<StoreError>,
) -> Result<(), CrestError> {
    match buffer.flush_if_due(store) {
        Ok(_) => Ok(()),
        Err(e) => {
            let message = e.to_string();
            *failure = Some(e);
            Err(CrestError::Callback(message))
        }
    }
}

/// Final flush, then sort the batch result into success, abort or failure.
fn finish_batch(
    result: Result<crest_core::BatchReport, CrestError>,
    buffer: &mut OperationBuffer,
    store: &dyn PersistenceSink,
    store_failure: Option<StoreError>,
    outcome: &mut RegionOutcome,
) -> Result<Option<String>, ProcessError> {
    if let Some(e) = store_failure {
        return Err(ProcessError::Store(e));
    }
    buffer.flush(store)?;
    match result {
        Ok(report) => {
            outcome.fetched += report.fetched;
            outcome.from_cache += report.from_cache;
            outcome.errors += report.errors;
            Ok(None)
        }
        Err(e) if e.is_batch_abort() => {
            if let CrestError::TooManyErrors { errors, .. } = &e {
                outcome.errors += errors;
            }
            Ok(Some(e.to_string()))
        }
        Err(e) => Err(ProcessError::Crest(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts() {
        let mut done = RegionOutcome::new(1, "A".into());
        done.estimates = 3;
        let mut aborted = RegionOutcome::new(2, "B".into());
        aborted.status = RegionStatus::Aborted {
            stage: RunKind::Prices,
            reason: "503".into(),
        };
        aborted.estimates = 1;
        let summary = RunSummary {
            kind: RunKind::Prices,
            regions: vec![done, aborted],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.aborted(), 1);
        assert_eq!(summary.estimates(), 4);
    }

    #[test]
    fn run_kind_displays_lowercase() {
        assert_eq!(RunKind::History.to_string(), "history");
        assert_eq!(RunKind::Prices.to_string(), "prices");
    }
}
