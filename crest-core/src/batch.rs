//! Bounded concurrent batch fetcher.
//!
//! Runs many GETs against one endpoint family with at most W requests in
//! flight (W = min(max_in_flight, job size)). A fixed pool of W worker threads
//! consumes tickets from a channel and posts completions to a results channel;
//! the control thread hands out one ticket per freed slot, so the window
//! refills immediately and failed URLs rejoin the back of the queue.
//!
//! - Cached URLs are delivered up front and never count toward the window or
//!   the error budget.
//! - Auth headers are minted inside the worker right before each send.
//! - HTTP 503 aborts the batch at once; other failures are retried until the
//!   error count exceeds ceil(sqrt(job size)).
//! - After an abort no callback fires. Requests already in flight finish and
//!   are discarded.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::auth::AuthProvider;
use crate::cache::CacheKey;
use crate::envelope::Envelope;
use crate::error::CrestError;
use crate::executor::{classify, prepare_request, CacheMode, Executor, RequestSpec};
use crate::transport::Verb;

/// Only a 200 counts as success inside a batch.
const BATCH_ACCEPTED: [u16; 1] = [200];

type SuccessFn<'a> = dyn FnMut(Envelope) -> Result<(), CrestError> + 'a;
type ErrorFn<'a> = dyn FnMut(&str, &CrestError) + 'a;

/// Maximum tolerated failures for a job of `size` URLs.
pub fn error_budget(size: usize) -> usize {
    (size as f64).sqrt().ceil() as usize
}

/// A set of GETs sharing one header template and representation.
pub struct BatchJob<'a> {
    urls: Vec<String>,
    headers: Vec<(String, String)>,
    representation: Option<String>,
    namespace: Option<String>,
    auth: Option<Arc<dyn AuthProvider>>,
    cache: CacheMode,
    on_success: Box<SuccessFn<'a>>,
    on_error: Option<Box<ErrorFn<'a>>>,
}

impl<'a> BatchJob<'a> {
    /// Duplicate URLs are collapsed, keeping first-seen order.
    pub fn new<F>(urls: impl IntoIterator<Item = String>, on_success: F) -> Self
    where
        F: FnMut(Envelope) -> Result<(), CrestError> + 'a,
    {
        let mut seen = HashSet::new();
        let urls = urls
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .collect();
        Self {
            urls,
            headers: Vec::new(),
            representation: None,
            namespace: None,
            auth: None,
            cache: CacheMode::ReadWrite,
            on_success: Box::new(on_success),
            on_error: None,
        }
    }

    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend_from_slice(headers);
        self
    }

    pub fn expecting(mut self, representation: impl Into<String>) -> Self {
        self.representation = Some(representation.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Provider minted per request; defaults to the executor's.
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.cache = mode;
        self
    }

    /// Called for every failed attempt that does not abort the batch outright.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: FnMut(&str, &CrestError) + 'a,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Outcome counters of a completed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub from_cache: usize,
    pub fetched: usize,
    pub errors: usize,
    pub budget: usize,
}

impl BatchReport {
    /// URLs handed to the success callback.
    pub fn delivered(&self) -> usize {
        self.from_cache + self.fetched
    }
}

/// Per-job request template shared with the workers.
struct Template {
    headers: Vec<(String, String)>,
    representation: Option<String>,
    namespace: Option<String>,
    timeout: Duration,
}

impl Template {
    fn spec_for(&self, url: &str) -> RequestSpec {
        let mut spec = RequestSpec::get(url).headers(&self.headers);
        spec.representation = self.representation.clone();
        spec.namespace = self.namespace.clone();
        spec
    }
}

type Completion = (String, Result<Envelope, CrestError>);

/// Drives batch jobs through an executor's transport and cache.
#[derive(Clone)]
pub struct BatchFetcher {
    executor: Executor,
}

impl BatchFetcher {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn run(&self, job: BatchJob<'_>) -> Result<BatchReport, CrestError> {
        let BatchJob {
            urls,
            headers,
            representation,
            namespace,
            auth,
            cache,
            mut on_success,
            mut on_error,
        } = job;

        let total = urls.len();
        let budget = error_budget(total);
        let mut report = BatchReport {
            total,
            budget,
            ..BatchReport::default()
        };

        let mut queue = VecDeque::with_capacity(total);
        for url in urls {
            if cache.reads() {
                let key = CacheKey::for_request(&Verb::Get, &url, namespace.as_deref());
                if let Some(envelope) = self.executor.lookup(&key) {
                    on_success(envelope)?;
                    report.from_cache += 1;
                    continue;
                }
            }
            queue.push_back(url);
        }
        if queue.is_empty() {
            return Ok(report);
        }

        let window = self.executor.config().max_in_flight.max(1).min(queue.len());
        let auth = auth.or_else(|| self.executor.auth().cloned());
        let template = Template {
            headers,
            representation,
            namespace,
            timeout: self.executor.config().batch_timeout(),
        };
        tracing::info!(
            total,
            cached = report.from_cache,
            window,
            budget,
            "starting batch"
        );

        let (ticket_tx, ticket_rx) = mpsc::channel::<String>();
        let ticket_rx = Mutex::new(ticket_rx);
        let (done_tx, done_rx) = mpsc::channel::<Completion>();

        thread::scope(|s| -> Result<(), CrestError> {
            // Owned here so every exit path closes the ticket channel.
            let ticket_tx = ticket_tx;
            for i in 0..window {
                let tickets = &ticket_rx;
                let done = done_tx.clone();
                let template = &template;
                let auth = auth.as_deref();
                let executor = &self.executor;
                thread::Builder::new()
                    .name(format!("crest-batch-{i}"))
                    .spawn_scoped(s, move || worker_loop(executor, template, auth, tickets, done))
                    .map_err(|e| CrestError::Transport {
                        url: String::new(),
                        message: format!("failed to spawn batch worker: {e}"),
                    })?;
            }
            drop(done_tx);

            let mut in_flight = 0usize;
            refill(&mut queue, &ticket_tx, &mut in_flight, window)?;

            while in_flight > 0 {
                let (url, result) = done_rx.recv().map_err(|_| CrestError::Transport {
                    url: String::new(),
                    message: "batch workers exited unexpectedly".into(),
                })?;
                in_flight -= 1;

                match result {
                    Ok(envelope) => {
                        if cache.writes() {
                            self.executor.remember(&envelope);
                        }
                        on_success(envelope)?;
                        report.fetched += 1;
                    }
                    Err(e @ CrestError::ServiceUnavailable { .. }) => {
                        tracing::warn!(url = %url, "service unavailable, aborting batch");
                        return Err(e);
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(
                            url = %url,
                            error = %e,
                            errors = report.errors,
                            budget,
                            "batch request failed, re-queued"
                        );
                        if let Some(cb) = on_error.as_mut() {
                            cb(&url, &e);
                        }
                        if report.errors > budget {
                            return Err(CrestError::TooManyErrors {
                                errors: report.errors,
                                budget,
                            });
                        }
                        queue.push_back(url);
                    }
                }

                refill(&mut queue, &ticket_tx, &mut in_flight, window)?;
            }
            Ok(())
        })?;

        tracing::info!(
            fetched = report.fetched,
            cached = report.from_cache,
            errors = report.errors,
            "batch complete"
        );
        Ok(report)
    }
}

/// Hand out tickets until the window is full or the queue is empty.
fn refill(
    queue: &mut VecDeque<String>,
    tickets: &Sender<String>,
    in_flight: &mut usize,
    window: usize,
) -> Result<(), CrestError> {
    while *in_flight < window {
        let Some(url) = queue.pop_front() else {
            break;
        };
        tickets.send(url).map_err(|e| CrestError::Transport {
            url: e.0,
            message: "batch workers exited unexpectedly".into(),
        })?;
        *in_flight += 1;
    }
    Ok(())
}

fn worker_loop(
    executor: &Executor,
    template: &Template,
    auth: Option<&dyn AuthProvider>,
    tickets: &Mutex<Receiver<String>>,
    done: Sender<Completion>,
) {
    loop {
        let url = {
            let rx = tickets.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.recv() {
                Ok(url) => url,
                Err(_) => break,
            }
        };
        let result = fetch_one(executor, template, auth, &url);
        if done.send((url, result)).is_err() {
            break;
        }
    }
}

fn fetch_one(
    executor: &Executor,
    template: &Template,
    auth: Option<&dyn AuthProvider>,
    url: &str,
) -> Result<Envelope, CrestError> {
    let spec = template.spec_for(url);
    let auth_header = match auth {
        Some(provider) => provider.auth_header()?,
        None => None,
    };
    let request = prepare_request(&spec, auth_header, template.timeout);
    let envelope = executor.send(&request, &spec)?;
    classify(&envelope, &BATCH_ACCEPTED, spec.representation.as_deref())?;
    Ok(envelope)
}
