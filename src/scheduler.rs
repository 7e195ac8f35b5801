// src/scheduler.rs
//
// The poll cycle.
//
// One cycle refreshes the server cache, then walks the servers in batches
// of at most `workers`: every server in a batch is queried concurrently,
// the batch's results are persisted and announced, and only then does the
// next batch start. Cycles are spaced `interval` apart measured from their
// start and never overlap.

use futures_util::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cache::ServerStateStore;
use crate::config::Config;
use crate::lookup::{LookupError, UrlLookup};
use crate::models::poll::{FailureKind, PollOutcome, RecordUpdate, TransitionEvent, TransitionKind};
use crate::models::server::ServerRecord;
use crate::notifier::Dispatcher;
use crate::operator::OperatorChannel;
use crate::query::{self, QueryClient};
use crate::storage::{RecordStore, StoreError};
use crate::transition;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub workers: usize,
    pub query_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.poll_interval(),
            workers: config.workers_count.max(1),
            query_timeout: config.query_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("record store: {0}")]
    Store(#[from] StoreError),

    #[error("lookup API: {0}")]
    Lookup(#[from] LookupError),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to refresh server cache: {0}")]
    Refresh(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct BatchTiming {
    pub size: usize,
    pub started: Instant,
    pub finished: Instant,
}

impl BatchTiming {
    pub fn duration(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

/// What one cycle did. Diagnostic only.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub batches: Vec<BatchTiming>,
    pub servers_processed: usize,
    pub lookups: usize,
    pub failures: usize,
    pub transitions: usize,
    pub duration: Duration,
    /// Shutdown stopped the cycle before its last batch.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn min_batch(&self) -> Duration {
        self.batches.iter().map(BatchTiming::duration).min().unwrap_or_default()
    }

    pub fn max_batch(&self) -> Duration {
        self.batches.iter().map(BatchTiming::duration).max().unwrap_or_default()
    }

    pub fn average_batch(&self) -> Duration {
        if self.batches.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.batches.iter().map(BatchTiming::duration).sum();
        total / self.batches.len() as u32
    }

    pub fn summary(&self, workers: usize) -> String {
        format!(
            "Polled {} servers in {:.4}s ({} failed, {} transitions)\n\
             Max batch time: {:.4}s\nMin batch time: {:.4}s\nAverage batch time: {:.4}s\n\
             Batches: {} of up to {}\nListing lookups: {}{}",
            self.servers_processed,
            self.duration.as_secs_f64(),
            self.failures,
            self.transitions,
            self.max_batch().as_secs_f64(),
            self.min_batch().as_secs_f64(),
            self.average_batch().as_secs_f64(),
            self.batches.len(),
            workers,
            self.lookups,
            if self.interrupted { "\nInterrupted by shutdown" } else { "" },
        )
    }
}

/// Contiguous groups of at most `size`, the last one possibly shorter.
pub fn partition<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// How long to wait after a cycle that took `elapsed`.
pub fn next_cycle_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop request too.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct BatchResult {
    timing: BatchTiming,
    lookups: usize,
    failures: usize,
    transitions: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn RecordStore>,
    query: Arc<dyn QueryClient>,
    lookup: Option<Arc<dyn UrlLookup>>,
    dispatcher: Dispatcher,
    operator: Arc<dyn OperatorChannel>,
    cache: ServerStateStore,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn RecordStore>,
        query: Arc<dyn QueryClient>,
        lookup: Option<Arc<dyn UrlLookup>>,
        dispatcher: Dispatcher,
        operator: Arc<dyn OperatorChannel>,
    ) -> Self {
        Self {
            config,
            store,
            query,
            lookup,
            dispatcher,
            operator,
            cache: ServerStateStore::new(),
        }
    }

    async fn setup(&self) -> Result<(), SetupError> {
        self.store.connect().await?;
        if let Some(lookup) = &self.lookup {
            lookup.connect().await?;
        }
        Ok(())
    }

    async fn release(&self) {
        if let Some(lookup) = &self.lookup {
            lookup.close().await;
        }
        self.store.close().await;
        info!("Poller stopped, resources released");
    }

    /// Run cycles until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval;
        let grace = self.config.shutdown_grace;
        let mut ready = false;

        info!(
            "Starting poller: interval={:?}, workers={}, query_timeout={:?}",
            interval, self.config.workers, self.config.query_timeout
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let cycle_started = Instant::now();

            if !ready {
                let attempt = {
                    let setup = self.setup();
                    tokio::pin!(setup);
                    tokio::select! {
                        result = &mut setup => Some(result),
                        _ = wait_for_stop(&mut shutdown) => {
                            tokio::time::timeout(grace, &mut setup).await.ok()
                        }
                    }
                };
                match attempt {
                    Some(Ok(())) => {
                        info!("Poller set up");
                        ready = true;
                    }
                    Some(Err(e)) => {
                        self.operator.report(
                            &format!("Poller setup failed, retrying in {:?}: {}", interval, e),
                            true,
                        );
                    }
                    None => {
                        warn!("Abandoning setup after {:?}", grace);
                        break;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            if ready {
                let stop = shutdown.clone();
                let finished = {
                    let cycle = self.run_cycle(&stop);
                    tokio::pin!(cycle);
                    tokio::select! {
                        result = &mut cycle => Some(result),
                        _ = wait_for_stop(&mut shutdown) => {
                            info!("Shutdown requested, letting the current batch finish");
                            match tokio::time::timeout(grace, &mut cycle).await {
                                Ok(result) => Some(result),
                                Err(_) => {
                                    warn!("Abandoning in-flight batch after {:?}", grace);
                                    None
                                }
                            }
                        }
                    }
                };

                match finished {
                    Some(Ok(report)) => self.operator.report(&report.summary(self.config.workers), false),
                    Some(Err(e)) => self.operator.report(
                        &format!("Cycle aborted, retrying in {:?}: {}", interval, e),
                        true,
                    ),
                    None => {}
                }
            }

            let elapsed = cycle_started.elapsed();
            if elapsed >= interval {
                debug!("Cycle took {:?}, starting the next one immediately", elapsed);
            }
            tokio::select! {
                _ = tokio::time::sleep(next_cycle_delay(interval, elapsed)) => {}
                _ = wait_for_stop(&mut shutdown) => break,
            }
        }

        self.release().await;
    }

    /// One full sweep. Stops issuing batches once `stop` turns true.
    pub async fn run_cycle(&mut self, stop: &watch::Receiver<bool>) -> Result<CycleReport, CycleError> {
        let started = Instant::now();
        let known = self
            .cache
            .refresh(self.store.as_ref())
            .await
            .map_err(CycleError::Refresh)?;
        debug!("Refreshed cache with {} servers", known);

        let mut report = CycleReport::default();
        let servers = self.cache.pollable();

        for batch in partition(&servers, self.config.workers) {
            if *stop.borrow() {
                info!("Shutdown requested, skipping remaining batches");
                report.interrupted = true;
                break;
            }

            let result = self.process_batch(batch).await;
            report.servers_processed += result.timing.size;
            report.lookups += result.lookups;
            report.failures += result.failures;
            report.transitions += result.transitions;
            report.batches.push(result.timing);
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    async fn process_batch(&self, batch: &[&ServerRecord]) -> BatchResult {
        let started = Instant::now();
        let polls = join_all(batch.iter().map(|record| self.poll_server(record))).await;

        let mut lookups = 0;
        let mut failures = 0;
        let mut pending: Vec<(RecordUpdate, TransitionEvent)> = Vec::with_capacity(polls.len());
        for (record, (outcome, looked_up)) in batch.iter().zip(polls) {
            lookups += looked_up;
            if !outcome.succeeded() {
                failures += 1;
                self.log_failure(record, &outcome);
            }
            pending.push(transition::detect(self.cache.lookup(outcome.server_id), &outcome));
        }

        let persisted = join_all(pending.iter().map(|(update, _)| self.persist(update))).await;

        let announce: Vec<&TransitionEvent> = pending
            .iter()
            .zip(persisted)
            .filter(|(_, stored)| *stored)
            .map(|((_, event), _)| event)
            .filter(|event| event.kind != TransitionKind::Unchanged)
            .collect();
        let transitions = announce.len();
        join_all(announce.into_iter().map(|event| self.dispatcher.dispatch(event))).await;

        BatchResult {
            timing: BatchTiming {
                size: batch.len(),
                started,
                finished: Instant::now(),
            },
            lookups,
            failures,
            transitions,
        }
    }

    /// Query one server and enrich a success with its listing URL.
    ///
    /// Returns the outcome and the number of auxiliary lookups made.
    async fn poll_server(&self, record: &ServerRecord) -> (PollOutcome, usize) {
        let mut outcome =
            query::execute(self.query.as_ref(), record.id, &record.address, self.config.query_timeout).await;

        let known_url = record
            .server_snapshot
            .as_ref()
            .and_then(|s| s.battle_url.clone());
        let mut lookups = 0;
        let mut lookup_failure = None;

        if let Ok(observation) = &mut outcome.result {
            if known_url.is_some() {
                observation.server.battle_url = known_url;
            } else if let Some(lookup) = &self.lookup {
                lookups += 1;
                match lookup.listing_url(&record.address, &observation.server).await {
                    Ok(url) => observation.server.battle_url = url,
                    Err(e) => lookup_failure = Some(format!("listing lookup failed: {}", e)),
                }
            }
        }

        // Counted as downtime like any other unexpected error.
        if let Some(detail) = lookup_failure {
            outcome = PollOutcome::failure(record.id, FailureKind::Unexpected, detail);
        }
        (outcome, lookups)
    }

    fn log_failure(&self, record: &ServerRecord, outcome: &PollOutcome) {
        let Err(failure) = &outcome.result else {
            return;
        };
        match failure.kind {
            FailureKind::Unreachable => {
                debug!("Server {} ({}) unreachable: {}", record.id, record.address, failure.detail)
            }
            FailureKind::Protocol => {
                warn!("Server {} ({}) sent a bad reply: {}", record.id, record.address, failure.detail)
            }
            FailureKind::Unexpected => self.operator.report(
                &format!(
                    "Unexpected error polling server {} ({}): {}",
                    record.id, record.address, failure.detail
                ),
                true,
            ),
        }
    }

    /// Returns whether the update landed.
    async fn persist(&self, update: &RecordUpdate) -> bool {
        match self.store.update_server(update).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Server {} was removed mid-cycle, dropping its result", update.server_id);
                false
            }
            Err(e) => {
                self.operator.report(
                    &format!("Failed to persist poll result for server {}: {}", update.server_id, e),
                    true,
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::{PlayerEntry, ServerId, ServerSnapshot};
    use crate::notifier::tests::RecordingDeliverer;
    use crate::operator::tests::RecordingChannel;
    use crate::query::tests::snapshot;
    use crate::query::QueryError;
    use crate::storage::memory::MemoryStore;
    use crate::storage::WatchListStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn address(id: ServerId) -> String {
        format!("10.0.0.{}:27015", id)
    }

    fn id_of(address: &str) -> ServerId {
        address
            .trim_start_matches("10.0.0.")
            .trim_end_matches(":27015")
            .parse()
            .unwrap()
    }

    /// Scripted query client. Servers answer unless listed in `down` or `errors`.
    #[derive(Default)]
    struct FakeQuery {
        log: Log,
        delay: Duration,
        down: Mutex<HashSet<ServerId>>,
        errors: Mutex<HashMap<ServerId, String>>,
        starts: Mutex<Vec<Instant>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delete_during_query: Mutex<Option<(Arc<MemoryStore>, ServerId)>>,
    }

    #[async_trait]
    impl QueryClient for FakeQuery {
        async fn query_state(&self, address: &str, _: Duration) -> Result<ServerSnapshot, QueryError> {
            let id = id_of(address);
            self.log.lock().push(format!("query:{}", id));
            self.starts.lock().push(Instant::now());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let doomed = self.delete_during_query.lock().clone();
            if let Some((store, victim)) = doomed {
                if victim == id {
                    store.delete_server(id).await.unwrap();
                }
            }

            if self.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(message) = self.errors.lock().get(&id) {
                return Err(QueryError::Unexpected(message.clone()));
            }
            if self.down.lock().contains(&id) {
                return Err(QueryError::Timeout(Duration::from_secs(1)));
            }
            Ok(snapshot(&format!("Server {} - (v1)", id)))
        }

        async fn query_roster(&self, _: &str, _: Duration) -> Result<Vec<PlayerEntry>, QueryError> {
            Ok(vec![])
        }
    }

    /// Memory store that logs persists and can fail its first connects.
    struct LoggingStore {
        inner: Arc<MemoryStore>,
        log: Log,
        failing_connects: AtomicUsize,
        connects: AtomicUsize,
        connect_delay: Mutex<Duration>,
        failing_updates: Mutex<HashSet<ServerId>>,
    }

    #[async_trait]
    impl RecordStore for LoggingStore {
        async fn connect(&self) -> Result<(), StoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failing_connects.load(Ordering::SeqCst) > 0 {
                self.failing_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::NotConnected);
            }
            let delay = *self.connect_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.inner.connect().await
        }

        async fn close(&self) {
            self.inner.close().await
        }

        async fn list_all_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
            self.inner.list_all_servers().await
        }

        async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>, StoreError> {
            self.inner.get_server(id).await
        }

        async fn update_server(&self, update: &RecordUpdate) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.log.lock().push(format!("persist:{}", update.server_id));
            if self.failing_updates.lock().contains(&update.server_id) {
                return Err(StoreError::NotConnected);
            }
            self.inner.update_server(update).await
        }

        async fn register_server(&self, address: &str) -> Result<ServerId, StoreError> {
            self.inner.register_server(address).await
        }

        async fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
            self.inner.delete_server(id).await
        }
    }

    #[derive(Default)]
    struct FakeLookup {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl UrlLookup for FakeLookup {
        async fn connect(&self) -> Result<(), LookupError> {
            Ok(())
        }

        async fn close(&self) {}

        async fn listing_url(&self, address: &str, _: &ServerSnapshot) -> Result<Option<String>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LookupError::NotConnected);
            }
            Ok(Some(format!("https://listing.example/{}", id_of(address))))
        }
    }

    struct Harness {
        memory: Arc<MemoryStore>,
        store: Arc<LoggingStore>,
        query: Arc<FakeQuery>,
        deliverer: Arc<RecordingDeliverer>,
        operator: Arc<RecordingChannel>,
        log: Log,
    }

    impl Harness {
        async fn new(servers: usize, query: FakeQuery) -> Self {
            let memory = Arc::new(MemoryStore::new());
            for id in 1..=servers as ServerId {
                memory.register_server(&address(id)).await.unwrap();
            }
            let log = query.log.clone();
            let store = Arc::new(LoggingStore {
                inner: memory.clone(),
                log: log.clone(),
                failing_connects: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                failing_updates: Mutex::new(HashSet::new()),
            });
            Self {
                memory,
                store,
                query: Arc::new(query),
                deliverer: Arc::new(RecordingDeliverer::default()),
                operator: Arc::new(RecordingChannel::default()),
                log,
            }
        }

        fn scheduler(&self, config: SchedulerConfig, lookup: Option<Arc<dyn UrlLookup>>) -> Scheduler {
            let watchers: Arc<dyn WatchListStore> = self.memory.clone();
            Scheduler::new(
                config,
                self.store.clone(),
                self.query.clone(),
                lookup,
                Dispatcher::new(watchers, self.deliverer.clone()),
                self.operator.clone(),
            )
        }
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(100),
            workers,
            query_timeout: Duration::from_secs(200),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn not_stopped() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn test_partition_keeps_remainder() {
        let items: Vec<u32> = (0..23).collect();
        let sizes: Vec<usize> = partition(&items, 10).map(<[u32]>::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);

        let items: Vec<u32> = (0..20).collect();
        let sizes: Vec<usize> = partition(&items, 10).map(<[u32]>::len).collect();
        assert_eq!(sizes, vec![10, 10]);

        let empty: Vec<u32> = vec![];
        assert_eq!(partition(&empty, 10).count(), 0);
        assert_eq!(partition(&items, 0).count(), 20);
    }

    #[test]
    fn test_next_cycle_delay() {
        let interval = Duration::from_secs(100);
        assert_eq!(next_cycle_delay(interval, Duration::from_secs(140)), Duration::ZERO);
        assert_eq!(next_cycle_delay(interval, Duration::from_secs(30)), Duration::from_secs(70));
    }

    #[test]
    fn test_report_statistics() {
        let t0 = Instant::now();
        let report = CycleReport {
            batches: vec![
                BatchTiming { size: 10, started: t0, finished: t0 + Duration::from_secs(1) },
                BatchTiming { size: 3, started: t0, finished: t0 + Duration::from_secs(3) },
            ],
            servers_processed: 13,
            lookups: 2,
            ..CycleReport::default()
        };
        assert_eq!(report.min_batch(), Duration::from_secs(1));
        assert_eq!(report.max_batch(), Duration::from_secs(3));
        assert_eq!(report.average_batch(), Duration::from_secs(2));
        let summary = report.summary(10);
        assert!(summary.contains("Polled 13 servers"));
        assert!(summary.contains("Listing lookups: 2"));
        assert_eq!(CycleReport::default().average_batch(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_batches_run_strictly_in_sequence() {
        let harness = Harness::new(23, FakeQuery::default()).await;
        let mut scheduler = harness.scheduler(config(10), None);

        let report = scheduler.run_cycle(&not_stopped()).await.unwrap();

        let sizes: Vec<usize> = report.batches.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(report.servers_processed, 23);
        assert_eq!(harness.query.max_in_flight.load(Ordering::SeqCst), 10);
        for pair in report.batches.windows(2) {
            assert!(pair[1].started >= pair[0].finished);
        }

        // Every persist of batch N precedes every query of batch N+1.
        let log = harness.log.lock().clone();
        let position = |entry: String| log.iter().position(|e| *e == entry).unwrap();
        for (batch, next) in [(1..=10, 11..=20), (11..=20, 21..=23)] {
            let last_persist = batch.map(|id| position(format!("persist:{}", id))).max().unwrap();
            let first_query = next.map(|id| position(format!("query:{}", id))).min().unwrap();
            assert!(last_persist < first_query, "batches overlapped: {:?}", log);
        }
    }

    #[tokio::test]
    async fn test_first_success_goes_online_and_notifies() {
        let harness = Harness::new(2, FakeQuery::default()).await;
        harness.memory.add_watcher(1, "https://hooks.example/a").await.unwrap();
        let mut scheduler = harness.scheduler(config(10), None);

        let report = scheduler.run_cycle(&not_stopped()).await.unwrap();
        assert_eq!(report.transitions, 2);

        let record = harness.memory.get_server(1).await.unwrap().unwrap();
        assert!(record.last_known_online);
        assert_eq!(record.offline_streak, 0);
        assert!(record.server_snapshot.is_some());

        let sent = harness.deliverer.sent.lock().clone();
        assert_eq!(sent, vec![(
            "https://hooks.example/a".to_string(),
            "Server Server 1 (TheIsland) went online!".to_string(),
        )]);
    }

    #[tokio::test]
    async fn test_offline_streak_and_single_offline_notice() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        harness.memory.add_watcher(1, "https://hooks.example/a").await.unwrap();
        let mut scheduler = harness.scheduler(config(10), None);
        let stop = not_stopped();

        scheduler.run_cycle(&stop).await.unwrap();
        harness.query.down.lock().insert(1);
        for _ in 0..3 {
            scheduler.run_cycle(&stop).await.unwrap();
        }

        let record = harness.memory.get_server(1).await.unwrap().unwrap();
        assert!(!record.last_known_online);
        assert_eq!(record.offline_streak, 3);
        // Stale but available.
        assert!(record.server_snapshot.is_some());

        harness.query.down.lock().clear();
        scheduler.run_cycle(&stop).await.unwrap();
        let record = harness.memory.get_server(1).await.unwrap().unwrap();
        assert_eq!(record.offline_streak, 0);

        let messages: Vec<String> = harness.deliverer.sent.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].ends_with("went online!"));
        assert!(messages[1].ends_with("went offline!"));
        assert!(messages[2].ends_with("went online!"));

        // Routine downtime never reaches the operator as an error.
        assert!(harness.operator.unexpected().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_error_is_reported_and_isolated() {
        let query = FakeQuery::default();
        query.errors.lock().insert(2, "socket exploded".to_string());
        let harness = Harness::new(3, query).await;
        let mut scheduler = harness.scheduler(config(10), None);

        let report = scheduler.run_cycle(&not_stopped()).await.unwrap();
        assert_eq!(report.failures, 1);

        let unexpected = harness.operator.unexpected();
        assert_eq!(unexpected.len(), 1);
        assert!(unexpected[0].contains("socket exploded"));

        let broken = harness.memory.get_server(2).await.unwrap().unwrap();
        assert_eq!(broken.offline_streak, 1);
        for id in [1, 3] {
            assert!(harness.memory.get_server(id).await.unwrap().unwrap().last_known_online);
        }
    }

    #[tokio::test]
    async fn test_server_deleted_mid_cycle_is_dropped() {
        let harness = Harness::new(3, FakeQuery::default()).await;
        *harness.query.delete_during_query.lock() = Some((harness.memory.clone(), 2));
        let mut scheduler = harness.scheduler(config(10), None);

        let report = scheduler.run_cycle(&not_stopped()).await.unwrap();
        assert_eq!(report.servers_processed, 3);
        assert!(harness.memory.get_server(2).await.unwrap().is_none());
        assert!(harness.memory.get_server(3).await.unwrap().unwrap().last_known_online);
        assert!(harness.operator.unexpected().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_failure_aborts_cycle() {
        let harness = Harness::new(3, FakeQuery::default()).await;
        harness.memory.close().await;
        let mut scheduler = harness.scheduler(config(10), None);

        let result = scheduler.run_cycle(&not_stopped()).await;
        assert!(matches!(result, Err(CycleError::Refresh(StoreError::NotConnected))));
        assert!(harness.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_skips_remaining_batches() {
        let harness = Harness::new(23, FakeQuery::default()).await;
        let mut scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(true);

        let report = scheduler.run_cycle(&rx).await.unwrap();
        drop(tx);
        assert!(report.interrupted);
        assert!(report.batches.is_empty());
    }

    #[tokio::test]
    async fn test_listing_lookup_runs_once_per_server() {
        let harness = Harness::new(2, FakeQuery::default()).await;
        let lookup = Arc::new(FakeLookup::default());
        let mut scheduler = harness.scheduler(config(10), Some(lookup.clone()));
        let stop = not_stopped();

        let first = scheduler.run_cycle(&stop).await.unwrap();
        assert_eq!(first.lookups, 2);
        let record = harness.memory.get_server(1).await.unwrap().unwrap();
        assert_eq!(
            record.server_snapshot.unwrap().battle_url.as_deref(),
            Some("https://listing.example/1")
        );

        // Known URLs are carried forward without asking again.
        let second = scheduler.run_cycle(&stop).await.unwrap();
        assert_eq!(second.lookups, 0);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        let record = harness.memory.get_server(2).await.unwrap().unwrap();
        assert!(record.server_snapshot.unwrap().battle_url.is_some());
    }

    #[tokio::test]
    async fn test_failed_lookup_counts_as_failed_poll() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        let lookup = Arc::new(FakeLookup { fail: true, ..FakeLookup::default() });
        let mut scheduler = harness.scheduler(config(10), Some(lookup));

        let report = scheduler.run_cycle(&not_stopped()).await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.lookups, 1);

        let record = harness.memory.get_server(1).await.unwrap().unwrap();
        assert!(!record.last_known_online);
        assert!(record.server_snapshot.is_none());
        assert_eq!(harness.operator.unexpected().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycle_is_followed_immediately() {
        let query = FakeQuery {
            delay: Duration::from_secs(140),
            ..FakeQuery::default()
        };
        let harness = Harness::new(1, query).await;
        let scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let starts = harness.query.starts.lock().clone();
        assert_eq!(starts.len(), 2);
        let gap = starts[1] - starts[0];
        assert!(gap >= Duration::from_secs(140) && gap < Duration::from_secs(141), "gap {:?}", gap);
        assert_eq!(harness.query.max_in_flight.load(Ordering::SeqCst), 1);

        // The abandoned cycle still released the store.
        assert!(harness.memory.list_all_servers().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_cycles_wait_out_the_interval() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        let scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let starts = harness.query.starts.lock().clone();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(100) && gap < Duration::from_secs(101), "gap {:?}", gap);
        }
        let summaries = harness
            .operator
            .reports
            .lock()
            .iter()
            .filter(|(detail, unexpected)| !unexpected && detail.starts_with("Polled 1 servers"))
            .count();
        assert_eq!(summaries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_setup_is_retried_next_interval() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        harness.store.failing_connects.store(1, Ordering::SeqCst);
        let scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(harness.store.connects.load(Ordering::SeqCst), 2);
        assert_eq!(harness.query.starts.lock().len(), 1);
        let unexpected = harness.operator.unexpected();
        assert_eq!(unexpected.len(), 1);
        assert!(unexpected[0].contains("setup failed"));
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_the_loop() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        let scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(rx))
            .await
            .expect("scheduler did not stop");
    }

    #[tokio::test]
    async fn test_persist_failure_is_isolated_and_retried() {
        let harness = Harness::new(3, FakeQuery::default()).await;
        harness.memory.add_watcher(1, "https://hooks.example/one").await.unwrap();
        harness.memory.add_watcher(2, "https://hooks.example/two").await.unwrap();
        harness.store.failing_updates.lock().insert(2);
        let mut scheduler = harness.scheduler(config(10), None);
        let stop = not_stopped();

        let report = scheduler.run_cycle(&stop).await.unwrap();
        assert_eq!(report.servers_processed, 3);
        assert_eq!(report.transitions, 2);
        for id in [1, 3] {
            assert!(harness.memory.get_server(id).await.unwrap().unwrap().last_known_online);
        }
        assert!(!harness.memory.get_server(2).await.unwrap().unwrap().last_known_online);

        let unexpected = harness.operator.unexpected();
        assert_eq!(unexpected.len(), 1);
        assert!(unexpected[0].contains("server 2"));
        let targets: Vec<String> = harness.deliverer.sent.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(targets, vec!["https://hooks.example/one".to_string()]);

        // The stored state still says offline, so the next cycle announces it.
        harness.store.failing_updates.lock().clear();
        let report = scheduler.run_cycle(&stop).await.unwrap();
        assert_eq!(report.transitions, 1);
        assert!(harness.memory.get_server(2).await.unwrap().unwrap().last_known_online);
        let sent = harness.deliverer.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "https://hooks.example/two");
        assert!(sent[1].1.ends_with("went online!"));
        assert_eq!(harness.operator.unexpected().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_wait_out_a_hung_setup() {
        let harness = Harness::new(1, FakeQuery::default()).await;
        *harness.store.connect_delay.lock() = Duration::from_secs(1000);
        let scheduler = harness.scheduler(config(10), None);
        let (tx, rx) = watch::channel(false);
        let started = Instant::now();
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Stop at 10s plus the 5s grace.
        let waited = started.elapsed();
        assert!(waited < Duration::from_secs(16), "waited {:?}", waited);
        assert!(harness.query.starts.lock().is_empty());
        assert!(harness.memory.list_all_servers().await.is_err());
    }
}
