//! Coarse connectivity state shared by all workers.

use std::sync::{Arc, Mutex};

use directup_protocol::NetworkStatus;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default slow-link threshold: 100 KiB/s.
pub const DEFAULT_SLOW_THRESHOLD_BPS: f64 = 100.0 * 1024.0;

/// Shared view of network health.
///
/// Fed by the OS reachability hook (`set_offline`) and by workers reporting
/// measured throughput. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    slow_threshold_bps: f64,
    state: Mutex<MonitorState>,
    tx: watch::Sender<NetworkStatus>,
}

#[derive(Default)]
struct MonitorState {
    offline: bool,
    last_bps: Option<f64>,
}

impl MonitorState {
    fn status(&self, slow_threshold_bps: f64) -> NetworkStatus {
        if self.offline {
            return NetworkStatus::Offline;
        }
        match self.last_bps {
            Some(bps) if bps < slow_threshold_bps => NetworkStatus::Slow,
            _ => NetworkStatus::Online,
        }
    }
}

impl NetworkMonitor {
    pub fn new(slow_threshold_bps: f64) -> Self {
        let (tx, _rx) = watch::channel(NetworkStatus::Online);
        Self {
            inner: Arc::new(MonitorInner {
                slow_threshold_bps,
                state: Mutex::new(MonitorState::default()),
                tx,
            }),
        }
    }

    /// Current status. Never blocks on I/O.
    pub fn status(&self) -> NetworkStatus {
        *self.inner.tx.borrow()
    }

    pub fn is_offline(&self) -> bool {
        self.status() == NetworkStatus::Offline
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.tx.subscribe()
    }

    /// Records an OS-level reachability change.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.offline = offline;
        if !offline {
            // Stale samples from before the outage say nothing about the new link.
            state.last_bps = None;
        }
        self.publish(&state);
    }

    /// Records a throughput sample measured by a worker.
    pub fn record_throughput(&self, bytes_per_second: f64) {
        let mut state = self.inner.state.lock().unwrap();
        state.last_bps = Some(bytes_per_second);
        self.publish(&state);
    }

    fn publish(&self, state: &MonitorState) {
        let next = state.status(self.inner.slow_threshold_bps);
        let changed = self.inner.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            match next {
                NetworkStatus::Offline => info!("network offline"),
                NetworkStatus::Online => info!("network online"),
                NetworkStatus::Slow => debug!(
                    threshold_bps = self.inner.slow_threshold_bps,
                    "network slow"
                ),
            }
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_THRESHOLD_BPS)
    }
}
