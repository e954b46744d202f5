//! Sync engine.
//!
//! Drives the operation queue: on an interval while active, on every
//! offline to online transition, and on demand through
//! [`SyncEngine::sync_now`]. Scheduled cycles pass through policy gates
//! (enabled, online, Wi-Fi, battery, minimum gap); manual cycles do not.
//!
//! Every cycle updates [`SyncStats`] and emits [`SyncEvent`]s. A failing
//! cycle is recorded and logged; the scheduler keeps ticking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chapel_types::{
    NetworkSnapshot, SkipReason, SyncConfig, SyncEvent, SyncState, SyncStats,
};

use crate::SharedStore;
use crate::cache::CacheStore;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::events::{EventDispatcher, EventReceiver};
use crate::queue::{DrainReport, OperationQueue};

/// Metadata key for the persisted [`SyncConfig`].
pub const CONFIG_KEY: &str = "sync.config";
/// Metadata key for the persisted [`SyncStats`].
pub const STATS_KEY: &str = "sync.stats";

/// Cache size policy applied after each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenancePolicy {
    pub max_size_bytes: u64,
    pub max_age: Duration,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Operations attempted (delivered plus failed).
    pub operations: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub exhausted: u32,
    pub conflicts: u32,
    /// Cache entries evicted by maintenance.
    pub evicted: usize,
    pub duration: Duration,
    /// Set when the cycle did not run.
    pub skipped: Option<SkipReason>,
    /// Set when the drain itself failed.
    pub error: Option<String>,
}

impl SyncOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Decide whether a scheduled cycle may run.
///
/// Gates are checked in order and the first failing one is returned.
/// Missing battery information never blocks a cycle.
pub fn evaluate_gates(
    config: &SyncConfig,
    snapshot: &NetworkSnapshot,
    since_last: Option<Duration>,
) -> Option<SkipReason> {
    if !config.enabled {
        return Some(SkipReason::Disabled);
    }
    if !snapshot.online {
        return Some(SkipReason::Offline);
    }
    if config.wifi_only && !snapshot.connection_type.satisfies_wifi_only() {
        return Some(SkipReason::NotWifi);
    }
    if let Some(battery) = snapshot.battery
        && battery.level < config.battery_threshold
    {
        return Some(SkipReason::LowBattery {
            level: battery.level,
            threshold: config.battery_threshold,
        });
    }
    if let Some(elapsed) = since_last
        && elapsed < config.min_gap()
    {
        return Some(SkipReason::TooSoon);
    }
    None
}

struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    queue: Arc<OperationQueue>,
    cache: CacheStore,
    store: SharedStore,
    connectivity: Connectivity,
    events: EventDispatcher,
    config: RwLock<SyncConfig>,
    stats: RwLock<SyncStats>,
    maintenance: MaintenancePolicy,
    active: AtomicBool,
    syncing: AtomicUsize,
    scheduler: Mutex<Option<Scheduler>>,
    last_finished: RwLock<Option<Instant>>,
}

/// Reconciles queued mutations with the server.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<OperationQueue>,
        cache: CacheStore,
        store: SharedStore,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                cache,
                store,
                connectivity,
                events: EventDispatcher::default(),
                config: RwLock::new(config),
                stats: RwLock::new(SyncStats::default()),
                maintenance: MaintenancePolicy::default(),
                active: AtomicBool::new(false),
                syncing: AtomicUsize::new(0),
                scheduler: Mutex::new(None),
                last_finished: RwLock::new(None),
            }),
        }
    }

    /// Replace the cache maintenance policy. Only valid before the engine
    /// is shared.
    #[must_use]
    pub fn with_maintenance(mut self, policy: MaintenancePolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.maintenance = policy;
        }
        self
    }

    /// Load persisted config and stats. Persisted config wins over the
    /// constructor's.
    pub async fn restore(&self) -> Result<()> {
        let (config, stats) = {
            let store = self.inner.store.lock().await;
            (
                store.get_metadata::<SyncConfig>(CONFIG_KEY)?,
                store.get_metadata::<SyncStats>(STATS_KEY)?,
            )
        };
        if let Some(config) = config {
            debug!("Restored sync config: {:?}", config);
            *self.inner.config.write().await = config;
        }
        if let Some(stats) = stats {
            *self.inner.stats.write().await = stats;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        if self.inner.syncing.load(Ordering::SeqCst) > 0 {
            SyncState::Syncing
        } else if self.inner.active.load(Ordering::SeqCst) {
            SyncState::Active
        } else {
            SyncState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn config(&self) -> SyncConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn stats(&self) -> SyncStats {
        self.inner.stats.read().await.clone()
    }

    /// Begin interval-driven scheduling. No-op if already active.
    pub async fn start(&self) {
        let mut scheduler = self.inner.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler(self.clone(), cancel.clone()));
        *scheduler = Some(Scheduler { cancel, handle });
        self.inner.active.store(true, Ordering::SeqCst);

        info!(
            "Sync engine started (interval {:?})",
            self.inner.config.read().await.interval()
        );
        self.inner.events.send(SyncEvent::Resumed);
    }

    /// Stop scheduling. An in-flight cycle is allowed to finish first.
    pub async fn stop(&self) {
        let Some(scheduler) = self.inner.scheduler.lock().await.take() else {
            return;
        };
        scheduler.cancel.cancel();
        if let Err(e) = scheduler.handle.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }
        self.inner.active.store(false, Ordering::SeqCst);
        info!("Sync engine stopped");
        self.inner.events.send(SyncEvent::Paused);
    }

    /// Replace and persist the sync policy. An active scheduler is restarted
    /// so a new interval takes effect.
    pub async fn update_config(&self, config: SyncConfig) -> Result<()> {
        *self.inner.config.write().await = config.clone();
        self.inner
            .store
            .lock()
            .await
            .set_metadata(CONFIG_KEY, &config)?;
        info!("Sync config updated: {:?}", config);

        if self.is_active() {
            self.stop().await;
            self.start().await;
        }
        Ok(())
    }

    /// Zero every counter.
    pub async fn reset_stats(&self) {
        let pending = self.inner.queue.len().await.unwrap_or(0);
        {
            let mut stats = self.inner.stats.write().await;
            *stats = SyncStats {
                pending_operations: pending,
                ..Default::default()
            };
        }
        self.persist_stats().await;
        info!("Sync stats reset");
    }

    /// Run a cycle if every policy gate passes.
    pub async fn scheduled_cycle(&self) -> SyncOutcome {
        let config = self.config().await;
        let snapshot = self.inner.connectivity.snapshot();
        let since_last = self.inner.last_finished.read().await.map(|t| t.elapsed());

        if let Some(reason) = evaluate_gates(&config, &snapshot, since_last) {
            debug!("Skipping scheduled sync: {}", reason);
            self.record_skip(reason.clone()).await;
            return SyncOutcome::skipped(reason);
        }

        self.run_cycle(true).await
    }

    /// Run a cycle now, ignoring policy gates.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.run_cycle(false).await
    }

    /// Fold a drain run outside a sync cycle into the stats, so dropped
    /// operations are counted whichever path replayed them.
    pub async fn record_drain(&self, report: &DrainReport) {
        if report.skipped {
            return;
        }
        let pending = self.inner.queue.len().await.unwrap_or_else(|e| {
            warn!("Failed to count queued operations: {}", e);
            0
        });
        fold_report(&mut *self.inner.stats.write().await, report, pending);
        self.persist_stats().await;
    }

    async fn record_skip(&self, reason: SkipReason) {
        self.inner.stats.write().await.skipped_syncs += 1;
        self.inner.events.send(SyncEvent::Skipped { reason });
    }

    async fn run_cycle(&self, scheduled: bool) -> SyncOutcome {
        self.inner.syncing.fetch_add(1, Ordering::SeqCst);
        let outcome = self.cycle(scheduled).await;
        self.inner.syncing.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn cycle(&self, scheduled: bool) -> SyncOutcome {
        self.inner.events.send(SyncEvent::Started { scheduled });
        let started = Instant::now();

        let report = match self.inner.queue.drain().await {
            Ok(report) if report.skipped => {
                self.record_skip(SkipReason::AlreadyRunning).await;
                return SyncOutcome::skipped(SkipReason::AlreadyRunning);
            }
            Ok(report) => report,
            Err(e) => {
                let duration = started.elapsed();
                error!("Sync cycle failed after {:?}: {}", duration, e);
                {
                    let mut stats = self.inner.stats.write().await;
                    stats.record_cycle(duration, false, OffsetDateTime::now_utc());
                    stats.last_error = Some(e.to_string());
                }
                self.finish().await;
                self.inner.events.send(SyncEvent::Failed {
                    error: e.to_string(),
                });
                return SyncOutcome {
                    duration,
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let policy = self.inner.maintenance;
        let evicted = self
            .inner
            .cache
            .maintain(policy.max_size_bytes, policy.max_age)
            .await;
        let pending = self.inner.queue.len().await.unwrap_or_else(|e| {
            warn!("Failed to count queued operations: {}", e);
            0
        });
        let snapshot = self.inner.connectivity.snapshot();
        let duration = started.elapsed();

        {
            let mut stats = self.inner.stats.write().await;
            let clean = report.failed == 0 && report.storage_errors.is_empty();
            stats.record_cycle(duration, clean, OffsetDateTime::now_utc());
            fold_report(&mut stats, &report, pending);
            stats.battery_level = snapshot.battery.map(|b| b.level);
            stats.connection_type = snapshot.connection_type;
        }
        self.finish().await;

        if report.exhausted > 0 {
            warn!(
                "{} queued operation(s) were dropped after exhausting retries",
                report.exhausted
            );
        }
        info!(
            "Sync cycle finished in {:?}: {} operations, {} pending",
            duration,
            report.operations(),
            pending
        );
        self.inner.events.send(SyncEvent::Completed {
            succeeded: report.success_count(),
            failed: report.failed,
            exhausted: report.exhausted,
            conflicts: report.conflicts,
            evicted,
            duration_ms: duration.as_millis() as u64,
        });

        SyncOutcome {
            operations: report.operations(),
            succeeded: report.success_count(),
            failed: report.failed,
            exhausted: report.exhausted,
            conflicts: report.conflicts,
            evicted,
            duration,
            skipped: None,
            error: report.storage_errors.first().cloned(),
        }
    }

    async fn finish(&self) {
        *self.inner.last_finished.write().await = Some(Instant::now());
        self.persist_stats().await;
    }

    async fn persist_stats(&self) {
        let stats = self.stats().await;
        if let Err(e) = self.inner.store.lock().await.set_metadata(STATS_KEY, &stats) {
            warn!("Failed to persist sync stats: {}", e);
        }
    }
}

fn fold_report(stats: &mut SyncStats, report: &DrainReport, pending: u64) {
    stats.exhausted_operations += u64::from(report.exhausted);
    stats.conflicts += u64::from(report.conflicts);
    stats.pending_operations = pending;
    stats.last_error = if let Some(e) = report.storage_errors.first() {
        Some(format!("storage failure while replaying: {}", e))
    } else if report.failed > 0 {
        Some(format!("{} operation(s) failed to replay", report.failed))
    } else {
        None
    };
}

async fn run_scheduler(engine: SyncEngine, cancel: CancellationToken) {
    let period = engine.config().await.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut network = engine.inner.connectivity.subscribe();
    let mut was_online = network.borrow_and_update().online;
    let mut network_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Sync scheduler cancelled");
                break;
            }
            _ = ticker.tick() => {
                engine.scheduled_cycle().await;
            }
            changed = network.changed(), if network_open => {
                if changed.is_err() {
                    network_open = false;
                    continue;
                }
                let online = network.borrow_and_update().online;
                if online && !was_online {
                    info!("Connectivity restored, syncing");
                    engine.scheduled_cycle().await;
                }
                was_online = online;
            }
        }
    }
}
