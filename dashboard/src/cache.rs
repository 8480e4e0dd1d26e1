//! Request-deduplicating query cache.
//!
//! Every query is identified by a [`QueryKey`] and holds the result of its last
//! successful fetch. Data is refreshed three ways: an interval poller that runs
//! while at least one [`Observer`] is alive, an explicit [`Query::invalidate`]
//! (which wakes the poller when observed), and [`Query::get`] on stale data.
//! Concurrent fetches of the same key share one in-flight request.

use crate::errors::Result;
use crate::metrics::{FETCHES_TOTAL, FETCH_FAILURES_TOTAL, FETCH_LATENCY_SECONDS};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: String,
    pub params: Vec<String>,
}

impl QueryKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, value: impl ToString) -> Self {
        self.params.push(value.to_string());
        self
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.params.join(","))
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Poll period while observed; `None` means invalidation-only.
    pub refetch_interval: Option<Duration>,
    /// Extra attempts after a failed fetch.
    pub retry: u32,
    pub retry_delay: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            refetch_interval: None,
            retry: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl QueryOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            refetch_interval: Some(interval),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub data: Option<Arc<T>>,
    pub stale: bool,
    pub is_fetching: bool,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub fetch_count: u64,
}

type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct QueryState<T> {
    data: Option<Arc<T>>,
    stale: bool,
    in_flight: bool,
    invalidations: u64,
    last_error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    fetch_count: u64,
    observers: usize,
    poller: Option<Poller>,
}

struct Poller {
    stop: oneshot::Sender<()>,
    _handle: JoinHandle<()>,
}

pub struct Query<T> {
    key: QueryKey,
    options: QueryOptions,
    fetcher: Fetcher<T>,
    state: Mutex<QueryState<T>>,
    completed: watch::Sender<u64>,
    wake: Notify,
}

impl<T: Send + Sync + 'static> Query<T> {
    fn new(key: QueryKey, options: QueryOptions, fetcher: Fetcher<T>) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            key,
            options,
            fetcher,
            state: Mutex::new(QueryState {
                data: None,
                stale: true,
                in_flight: false,
                invalidations: 0,
                last_error: None,
                updated_at: None,
                fetch_count: 0,
                observers: 0,
                poller: None,
            }),
            completed,
            wake: Notify::new(),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Last successfully fetched data, without triggering a fetch.
    pub fn data(&self) -> Option<Arc<T>> {
        self.state.lock().data.clone()
    }

    pub fn snapshot(&self) -> QuerySnapshot<T> {
        let state = self.state.lock();
        QuerySnapshot {
            data: state.data.clone(),
            stale: state.stale,
            is_fetching: state.in_flight,
            last_error: state.last_error.clone(),
            updated_at: state.updated_at,
            fetch_count: state.fetch_count,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// Returns cached data, fetching first if there is none or it is stale.
    pub async fn get(&self) -> Option<Arc<T>> {
        let needs_fetch = {
            let state = self.state.lock();
            state.data.is_none() || state.stale
        };
        if needs_fetch {
            self.fetch().await
        } else {
            self.data()
        }
    }

    /// Fetches now, joining an outstanding fetch for this key if there is one.
    ///
    /// Returns whatever the cache holds afterwards; after a failed fetch that
    /// is the previous (stale) data.
    pub async fn fetch(&self) -> Option<Arc<T>> {
        let mut completed = self.completed.subscribe();
        let started_at = {
            let mut state = self.state.lock();
            if state.in_flight {
                None
            } else {
                state.in_flight = true;
                Some(state.invalidations)
            }
        };

        let Some(invalidations) = started_at else {
            debug!("Joining in-flight fetch for {}", self.key);
            let _ = completed.changed().await;
            return self.data();
        };

        let mut guard = InFlight {
            query: self,
            armed: true,
        };
        let result = self.fetch_with_retry().await;
        guard.finish(result, invalidations);
        self.data()
    }

    async fn fetch_with_retry(&self) -> Result<T> {
        let start = Instant::now();
        let max_attempts = self.options.retry + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            FETCHES_TOTAL.inc();

            match (self.fetcher)().await {
                Ok(value) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    FETCH_LATENCY_SECONDS.observe(elapsed);
                    if attempt > 1 {
                        info!("Query {} succeeded on attempt {}", self.key, attempt);
                    } else {
                        debug!("Query {} fetched in {:.3}s", self.key, elapsed);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    FETCH_FAILURES_TOTAL.inc();
                    if attempt >= max_attempts {
                        error!(
                            "Query {} failed after {} attempts: {}",
                            self.key, attempt, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Query {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        self.key, attempt, max_attempts, e, self.options.retry_delay
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }
    }

    /// Marks the data stale and wakes the poller if anyone is observing.
    pub fn invalidate(&self) {
        let observed = {
            let mut state = self.state.lock();
            state.stale = true;
            state.invalidations += 1;
            state.observers > 0
        };
        debug!("Invalidated {} (observed: {})", self.key, observed);
        if observed {
            self.wake.notify_one();
        }
    }

    /// Registers an observer; the first one starts the poller.
    pub fn observe(self: &Arc<Self>) -> Observer<T> {
        let changes = self.completed.subscribe();
        {
            // count and poller change under one lock
            let mut state = self.state.lock();
            state.observers += 1;
            if state.observers == 1 {
                state.poller = Some(self.start_poller());
            }
        }
        Observer {
            query: self.clone(),
            changes,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers
    }

    pub(crate) fn is_polling(&self) -> bool {
        self.state.lock().poller.is_some()
    }

    fn start_poller(self: &Arc<Self>) -> Poller {
        let ticker = self.options.refetch_interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(self.clone(), ticker, stopped));
        debug!("Started poller for {}", self.key);
        Poller {
            stop,
            _handle: handle,
        }
    }

    fn release_observer(&self) {
        let poller = {
            let mut state = self.state.lock();
            state.observers = state.observers.saturating_sub(1);
            if state.observers == 0 {
                state.poller.take()
            } else {
                None
            }
        };
        if let Some(poller) = poller {
            let _ = poller.stop.send(());
            debug!("Stopped poller for {}", self.key);
        }
    }
}

/// Clears the in-flight flag even if the fetching future is dropped.
struct InFlight<'a, T: Send + Sync + 'static> {
    query: &'a Query<T>,
    armed: bool,
}

impl<T: Send + Sync + 'static> InFlight<'_, T> {
    fn finish(&mut self, result: Result<T>, invalidations: u64) {
        let mut state = self.query.state.lock();
        match result {
            Ok(value) => {
                state.data = Some(Arc::new(value));
                // An invalidation that raced this fetch keeps the entry stale.
                state.stale = state.invalidations != invalidations;
                state.last_error = None;
                state.updated_at = Some(Utc::now());
            }
            Err(e) => {
                state.stale = true;
                state.last_error = Some(e.to_string());
            }
        }
        state.fetch_count += 1;
        state.in_flight = false;
        self.query.completed.send_modify(|generation| *generation += 1);
        self.armed = false;
    }
}

impl<T: Send + Sync + 'static> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.query.state.lock();
            state.in_flight = false;
            self.query.completed.send_modify(|generation| *generation += 1);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn poll_loop<T: Send + Sync + 'static>(
    query: Arc<Query<T>>,
    mut ticker: Option<Interval>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = next_tick(&mut ticker) => {}
            _ = query.wake.notified() => {
                debug!("Refetching invalidated query {}", query.key);
            }
        }
        query.fetch().await;
    }
}

/// Keeps a query polled while alive.
pub struct Observer<T: Send + Sync + 'static> {
    query: Arc<Query<T>>,
    changes: watch::Receiver<u64>,
}

impl<T: Send + Sync + 'static> Observer<T> {
    pub fn query(&self) -> &Arc<Query<T>> {
        &self.query
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.query.data()
    }

    /// Waits for the next completed fetch and returns the cached data.
    pub async fn changed(&mut self) -> Option<Arc<T>> {
        self.changes.changed().await.ok()?;
        self.query.data()
    }
}

impl<T: Send + Sync + 'static> Drop for Observer<T> {
    fn drop(&mut self) {
        self.query.release_observer();
    }
}

trait Invalidate: Send + Sync {
    fn invalidate(&self);

    fn observers(&self) -> usize;
}

impl<T: Send + Sync + 'static> Invalidate for Query<T> {
    fn invalidate(&self) {
        Query::invalidate(self);
    }

    fn observers(&self) -> usize {
        self.observer_count()
    }
}

struct Entry {
    query: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn Invalidate>,
}

/// Registry of queries; the single source of truth for fetched data.
#[derive(Clone, Default)]
pub struct QueryClient {
    entries: Arc<Mutex<HashMap<QueryKey, Entry>>>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the query for `key`, creating it with `fetcher` if needed.
    pub fn query<T, F, Fut>(&self, key: QueryKey, options: QueryOptions, fetcher: F) -> Arc<Query<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            match entry.query.clone().downcast::<Query<T>>() {
                Ok(query) => return query,
                Err(_) => warn!("Query {} re-registered with a different type", key),
            }
        }

        let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
        let query = Arc::new(Query::new(key.clone(), options, fetcher));
        entries.insert(
            key,
            Entry {
                query: query.clone(),
                handle: query.clone(),
            },
        );
        query
    }

    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        let query = self.entries.lock().get(key)?.query.clone();
        query.downcast::<Query<T>>().ok()?.data()
    }

    /// Invalidates every query whose key has this logical name.
    pub fn invalidate_queries(&self, name: &str) -> usize {
        let handles: Vec<Arc<dyn Invalidate>> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, entry)| entry.handle.clone())
            .collect();

        for handle in &handles {
            handle.invalidate();
        }
        handles.len()
    }

    /// Drops unobserved queries that nothing outside the registry holds.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        // The registry itself holds two references per entry.
        entries.retain(|_, entry| entry.handle.observers() > 0 || Arc::strong_count(&entry.query) > 2);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
