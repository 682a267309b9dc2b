//! Sync orchestration
//!
//! Runs sync passes over the registered targets: every target's pending queue
//! is replayed in order (one collection fully before the next), then each
//! collection is reconciled with the remote. Passes are triggered by a fixed
//! timer, by connectivity coming back while writes are pending, and manually.
//!
//! A failed pass is retried after `retry_base_delay * attempt` until
//! `max_retries` retries have failed; the status then stays `Error` until
//! [`SyncService::retry`] is called.

use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::reporting::{report_error, ErrorReporter, ReportContext, TracingReporter};
use crate::repository::{PullReport, ReplayReport, SyncTarget};
use logger_redacted::redacted_warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Pending { count: u64 },
    Error { message: String },
    Offline,
    Retrying { attempt: u32, delay_ms: u64 },
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Pending { count } => write!(f, "pending ({} operations)", count),
            SyncStatus::Error { message } => write!(f, "error: {}", message),
            SyncStatus::Offline => write!(f, "offline"),
            SyncStatus::Retrying { attempt, delay_ms } => {
                write!(f, "retrying (attempt {} in {}ms)", attempt, delay_ms)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncServiceConfig {
    /// Periodic sync interval
    pub interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Run a pass as soon as the service starts
    pub sync_on_start: bool,
}

impl Default for SyncServiceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_retries: 5,
            retry_base_delay_ms: 2_000,
            sync_on_start: true,
        }
    }
}

impl SyncServiceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Totals of one successful pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub replay: ReplayReport,
    pub pull: PullReport,
    pub pending: u64,
}

struct Inner {
    targets: Vec<Arc<dyn SyncTarget>>,
    connectivity: ConnectivityMonitor,
    config: SyncServiceConfig,
    reporter: Arc<dyn ErrorReporter>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncStatus>,
    pass_lock: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_status(&self, status: SyncStatus) {
        tracing::debug!(status = %status, "Sync status");
        self.status.send_replace(status.clone());
        let _ = self.events.send(status);
    }

    async fn pending_total(&self) -> SyncResult<u64> {
        let mut total = 0;
        for target in &self.targets {
            total += target.pending_count().await?;
        }
        Ok(total)
    }

    /// One serialized pass over all targets
    async fn run_pass(&self) -> SyncResult<SyncSummary> {
        let _guard = self.pass_lock.lock().await;

        if !self.connectivity.is_online() {
            self.set_status(SyncStatus::Offline);
            return Err(SyncError::Offline);
        }

        self.set_status(SyncStatus::Syncing);
        let mut summary = SyncSummary::default();

        for target in &self.targets {
            summary.replay += target.replay_pending().await?;
        }
        for target in &self.targets {
            summary.pull += target.pull_and_reconcile().await?;
        }

        summary.pending = self.pending_total().await?;
        if summary.pending > 0 {
            self.set_status(SyncStatus::Pending {
                count: summary.pending,
            });
        } else {
            self.set_status(SyncStatus::Synced);
        }

        tracing::info!(
            replayed = summary.replay.succeeded,
            pulled = summary.pull.pulled,
            conflicts = summary.replay.conflicts + summary.pull.conflicts,
            pending = summary.pending,
            "Sync pass complete"
        );
        Ok(summary)
    }

    fn exhausted_status(&self) -> SyncStatus {
        SyncStatus::Error {
            message: format!("sync failed after {} retries", self.config.max_retries),
        }
    }

    fn on_success(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
    }

    fn report(&self, error: &SyncError, attempt: u32) {
        report_error(
            self.reporter.as_ref(),
            error,
            &ReportContext::new("sync_pass").with("attempt", attempt),
        );
    }
}

/// Run a pass and, if it fails, start the retry schedule
async fn run_and_schedule(inner: Arc<Inner>) -> SyncResult<SyncSummary> {
    match inner.run_pass().await {
        Ok(summary) => {
            inner.on_success();
            Ok(summary)
        }
        Err(SyncError::Offline) => Err(SyncError::Offline),
        Err(e) => {
            inner.report(&e, 0);
            let mut retry_task = inner.retry_task.lock();
            let running = retry_task.as_ref().is_some_and(|task| !task.is_finished());
            if !running {
                *retry_task = Some(tokio::spawn(retry_loop(Arc::clone(&inner))));
            }
            Err(e)
        }
    }
}

async fn retry_loop(inner: Arc<Inner>) {
    loop {
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > inner.config.max_retries {
            inner.exhausted.store(true, Ordering::SeqCst);
            tracing::error!(
                max_retries = inner.config.max_retries,
                "Giving up on sync until manual retry"
            );
            inner.set_status(inner.exhausted_status());
            return;
        }

        let delay = inner.config.retry_delay(attempt);
        inner.set_status(SyncStatus::Retrying {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        tokio::time::sleep(delay).await;

        match inner.run_pass().await {
            Ok(_) => {
                inner.attempts.store(0, Ordering::SeqCst);
                inner.exhausted.store(false, Ordering::SeqCst);
                return;
            }
            // Connectivity restoration restarts syncing
            Err(SyncError::Offline) => return,
            Err(e) => {
                redacted_warn!(format!("Sync retry failed: {}", e), attempt = attempt);
                inner.report(&e, attempt);
            }
        }
    }
}

/// Background sync driver; clones share one service
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    pub fn new(
        targets: Vec<Arc<dyn SyncTarget>>,
        connectivity: ConnectivityMonitor,
        config: SyncServiceConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                targets,
                connectivity,
                config,
                reporter: Arc::new(TracingReporter::new()),
                status,
                events,
                pass_lock: tokio::sync::Mutex::new(()),
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
                retry_task: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the reporter; only effective before the service is shared
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reporter = reporter;
        }
        self
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Every status transition
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self) -> SyncResult<u64> {
        self.inner.pending_total().await
    }

    /// Start the periodic timer and the connectivity listener
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let period = inner.config.interval();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            if !inner.config.sync_on_start {
                ticker.tick().await;
            }
            loop {
                ticker.tick().await;
                if inner.exhausted.load(Ordering::SeqCst) || !inner.connectivity.is_online() {
                    continue;
                }
                tracing::debug!("Periodic sync");
                let _ = run_and_schedule(Arc::clone(&inner)).await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        let mut changes = inner.connectivity.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped = skipped, "Connectivity events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                if !change.current.is_online() {
                    inner.set_status(SyncStatus::Offline);
                    continue;
                }
                if !change.is_restored() {
                    continue;
                }
                // Back online but waiting for a manual retry
                if inner.exhausted.load(Ordering::SeqCst) {
                    inner.set_status(inner.exhausted_status());
                    continue;
                }

                match inner.pending_total().await {
                    Ok(0) => inner.set_status(SyncStatus::Idle),
                    Ok(pending) => {
                        tracing::info!(
                            pending = pending,
                            "Connectivity restored, syncing pending operations"
                        );
                        let _ = run_and_schedule(Arc::clone(&inner)).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not count pending operations"),
                }
            }
        }));

        tracing::info!(interval_secs = self.inner.config.interval_secs, "Sync service started");
    }

    /// Run a pass now; a failure starts the retry schedule
    pub async fn sync_now(&self) -> SyncResult<SyncSummary> {
        run_and_schedule(Arc::clone(&self.inner)).await
    }

    /// Reset the retry budget and sync immediately
    pub async fn retry(&self) -> SyncResult<SyncSummary> {
        if let Some(task) = self.inner.retry_task.lock().take() {
            task.abort();
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.sync_now().await
    }

    /// Stop the timer, the connectivity listener and any scheduled retry
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.inner.retry_task.lock().take() {
            task.abort();
        }
        tracing::info!("Sync service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityStatus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Target whose replay fails until `failures` runs out
    struct ScriptedTarget {
        name: &'static str,
        failures: AtomicU32,
        pending: AtomicU64,
        replays: AtomicU32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedTarget {
        fn new(
            name: &'static str,
            failures: u32,
            pending: u64,
            log: Arc<Mutex<Vec<&'static str>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: AtomicU32::new(failures),
                pending: AtomicU64::new(pending),
                replays: AtomicU32::new(0),
                log,
            })
        }
    }

    #[async_trait]
    impl SyncTarget for ScriptedTarget {
        fn collection(&self) -> &'static str {
            self.name
        }

        async fn pending_count(&self) -> SyncResult<u64> {
            Ok(self.pending.load(Ordering::SeqCst))
        }

        async fn replay_pending(&self) -> SyncResult<ReplayReport> {
            self.replays.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(self.name);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Network("connection reset".to_string()));
            }
            let attempted = self.pending.swap(0, Ordering::SeqCst);
            Ok(ReplayReport {
                attempted,
                succeeded: attempted,
                ..Default::default()
            })
        }

        async fn pull_and_reconcile(&self) -> SyncResult<PullReport> {
            Ok(PullReport::default())
        }
    }

    fn config(max_retries: u32) -> SyncServiceConfig {
        SyncServiceConfig {
            interval_secs: 3_600,
            max_retries,
            retry_base_delay_ms: 1_000,
            sync_on_start: false,
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<SyncStatus>,
        wanted: impl Fn(&SyncStatus) -> bool,
    ) -> Vec<SyncStatus> {
        let mut seen = Vec::new();
        loop {
            let status = rx.recv().await.unwrap();
            let done = wanted(&status);
            seen.push(status);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_targets_replay_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let prescriptions = ScriptedTarget::new("prescriptions", 0, 2, log.clone());
        let medications = ScriptedTarget::new("medications", 0, 1, log.clone());
        let service = SyncService::new(
            vec![prescriptions, medications],
            ConnectivityMonitor::default(),
            config(3),
        );

        let summary = service.sync_now().await.unwrap();
        assert_eq!(summary.replay.succeeded, 3);
        assert_eq!(summary.pending, 0);
        assert_eq!(*log.lock(), vec!["prescriptions", "medications"]);
        assert_eq!(service.status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_offline_pass_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", 0, 1, log.clone());
        let connectivity = ConnectivityMonitor::new(ConnectivityStatus::Offline);
        let service = SyncService::new(vec![target], connectivity, config(3));

        assert!(matches!(service.sync_now().await, Err(SyncError::Offline)));
        assert_eq!(service.status(), SyncStatus::Offline);
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_is_linear_and_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", u32::MAX, 1, log.clone());
        let service =
            SyncService::new(vec![target.clone()], ConnectivityMonitor::default(), config(3));
        let mut events = service.subscribe();

        assert!(service.sync_now().await.is_err());
        let seen = wait_for(&mut events, |s| matches!(s, SyncStatus::Error { .. })).await;

        let delays: Vec<u64> = seen
            .iter()
            .filter_map(|s| match s {
                SyncStatus::Retrying { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 3_000]);
        // Initial pass plus one per retry
        assert_eq!(target.replays.load(Ordering::SeqCst), 4);
        assert!(service.is_exhausted());

        // Nothing else is scheduled once exhausted
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.replays.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_after_exhaustion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", 2, 1, log.clone());
        let service =
            SyncService::new(vec![target.clone()], ConnectivityMonitor::default(), config(1));
        let mut events = service.subscribe();

        assert!(service.sync_now().await.is_err());
        wait_for(&mut events, |s| matches!(s, SyncStatus::Error { .. })).await;
        assert!(service.is_exhausted());

        let summary = service.retry().await.unwrap();
        assert_eq!(summary.replay.succeeded, 1);
        assert!(!service.is_exhausted());
        assert_eq!(service.status(), SyncStatus::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_sync_when_pending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", 0, 2, log.clone());
        let connectivity = ConnectivityMonitor::new(ConnectivityStatus::Offline);
        let service = SyncService::new(vec![target.clone()], connectivity.clone(), config(3));
        let mut events = service.subscribe();
        service.start();
        tokio::task::yield_now().await;

        connectivity.set_status(ConnectivityStatus::Online);
        wait_for(&mut events, |s| *s == SyncStatus::Synced).await;
        assert_eq!(target.replays.load(Ordering::SeqCst), 1);

        connectivity.set_status(ConnectivityStatus::Offline);
        wait_for(&mut events, |s| *s == SyncStatus::Offline).await;

        // Nothing pending: reconnecting does not sync
        connectivity.set_status(ConnectivityStatus::Online);
        wait_for(&mut events, |s| *s == SyncStatus::Idle).await;
        assert_eq!(target.replays.load(Ordering::SeqCst), 1);

        service.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_exhaustion_keeps_error_status() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", u32::MAX, 1, log.clone());
        let connectivity = ConnectivityMonitor::default();
        let service = SyncService::new(vec![target.clone()], connectivity.clone(), config(1));
        let mut events = service.subscribe();
        service.start();
        tokio::task::yield_now().await;

        assert!(service.sync_now().await.is_err());
        wait_for(&mut events, |s| matches!(s, SyncStatus::Error { .. })).await;
        let replays = target.replays.load(Ordering::SeqCst);

        connectivity.set_status(ConnectivityStatus::Offline);
        wait_for(&mut events, |s| *s == SyncStatus::Offline).await;
        connectivity.set_status(ConnectivityStatus::Online);
        wait_for(&mut events, |s| matches!(s, SyncStatus::Error { .. })).await;

        assert!(connectivity.is_online());
        assert!(service.is_exhausted());
        assert!(matches!(service.status(), SyncStatus::Error { .. }));
        assert_eq!(target.replays.load(Ordering::SeqCst), replays);

        service.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_runs_passes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = ScriptedTarget::new("prescriptions", 0, 0, log.clone());
        let service =
            SyncService::new(vec![target.clone()], ConnectivityMonitor::default(), config(3));
        service.start();

        tokio::time::sleep(Duration::from_secs(3_600 * 2 + 1)).await;
        assert_eq!(target.replays.load(Ordering::SeqCst), 2);

        service.shutdown();
        tokio::time::sleep(Duration::from_secs(3_600 * 2)).await;
        assert_eq!(target.replays.load(Ordering::SeqCst), 2);
    }
}
