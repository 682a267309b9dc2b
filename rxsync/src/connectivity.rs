//! Connectivity monitoring
//!
//! Tracks whether the remote store is reachable and broadcasts every
//! online/offline transition to any number of subscribers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectivityStatus::Online)
    }
}

/// A status change observed by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub previous: ConnectivityStatus,
    pub current: ConnectivityStatus,
}

impl ConnectivityChange {
    /// Offline to online
    pub fn is_restored(&self) -> bool {
        !self.previous.is_online() && self.current.is_online()
    }
}

/// Reachability check polled by the monitor
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> ConnectivityStatus;
}

/// Probe that issues a HEAD request and treats any response as online
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> crate::SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> ConnectivityStatus {
        match self.client.head(&self.url).send().await {
            Ok(_) => ConnectivityStatus::Online,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Connectivity probe failed");
                ConnectivityStatus::Offline
            }
        }
    }
}

struct Inner {
    state: watch::Sender<ConnectivityStatus>,
    changes: broadcast::Sender<ConnectivityChange>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }
    }
}

/// Shared connectivity state; clones observe the same status
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityStatus) -> Self {
        let (state, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state,
                changes,
                probe_task: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Record a new status. Returns the change if the status actually changed.
    pub fn set_status(&self, status: ConnectivityStatus) -> Option<ConnectivityChange> {
        let previous = self.inner.state.send_replace(status);
        if previous == status {
            return None;
        }

        let change = ConnectivityChange {
            previous,
            current: status,
        };
        tracing::info!(previous = ?previous, current = ?status, "Connectivity changed");

        // No subscribers is fine
        let _ = self.inner.changes.send(change);
        Some(change)
    }

    /// Transitions only
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.inner.changes.subscribe()
    }

    /// Current status plus change notification
    pub fn watch(&self) -> watch::Receiver<ConnectivityStatus> {
        self.inner.state.subscribe()
    }

    /// Poll `probe` every `interval`, replacing any previous probe task
    pub fn spawn_probe(&self, probe: Arc<dyn ConnectivityProbe>, interval: Duration) {
        let monitor = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = probe.check().await;
                let Some(inner) = monitor.upgrade() else {
                    break;
                };
                ConnectivityMonitor { inner }.set_status(status);
            }
        });

        if let Some(previous) = self.inner.probe_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop polling
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.probe_task.lock().take() {
            task.abort();
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityStatus::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ToggleProbe {
        online: AtomicBool,
    }

    #[async_trait]
    impl ConnectivityProbe for ToggleProbe {
        async fn check(&self) -> ConnectivityStatus {
            if self.online.load(Ordering::SeqCst) {
                ConnectivityStatus::Online
            } else {
                ConnectivityStatus::Offline
            }
        }
    }

    #[tokio::test]
    async fn test_only_transitions_are_broadcast() {
        let monitor = ConnectivityMonitor::new(ConnectivityStatus::Online);
        let mut first = monitor.subscribe();
        let mut second = monitor.subscribe();

        assert!(monitor.set_status(ConnectivityStatus::Online).is_none());
        let change = monitor.set_status(ConnectivityStatus::Offline).unwrap();
        assert!(!change.is_restored());
        let change = monitor.set_status(ConnectivityStatus::Online).unwrap();
        assert!(change.is_restored());

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().current, ConnectivityStatus::Offline);
            assert_eq!(rx.recv().await.unwrap().current, ConnectivityStatus::Online);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::default();
        let clone = monitor.clone();
        let mut watcher = monitor.watch();

        clone.set_status(ConnectivityStatus::Offline);
        assert!(!monitor.is_online());

        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), ConnectivityStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_drives_status() {
        let monitor = ConnectivityMonitor::new(ConnectivityStatus::Offline);
        let probe = Arc::new(ToggleProbe {
            online: AtomicBool::new(true),
        });
        let mut changes = monitor.subscribe();

        monitor.spawn_probe(probe.clone(), Duration::from_secs(5));
        let change = changes.recv().await.unwrap();
        assert!(change.is_restored());

        probe.online.store(false, Ordering::SeqCst);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.current, ConnectivityStatus::Offline);

        monitor.shutdown();
    }
}
