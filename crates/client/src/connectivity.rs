//! Backend reachability monitoring.
//!
//! The monitor owns the single [`ConnectionState`] the rest of the layer
//! reads at decision time. The embedding shell feeds it the platform's
//! low-level link signals (`link_went_up`/`link_went_down`, focus/click
//! hints); the monitor confirms them with real probes against the health
//! endpoint. A hard "link down" signal is trusted immediately, a "link up"
//! signal only after a probe succeeds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::remote::RemoteCatalog;

/// Upper bound on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Background poll period; catches failures the platform never signals.
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Settle time after a "link up" signal before probing.
const LINK_UP_GRACE: Duration = Duration::from_millis(500);
/// Minimum gap between probes triggered by user-activity hints.
const ACTIVITY_PROBE_MIN_GAP: Duration = Duration::from_secs(2);

/// Reachability of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn is_online(&self) -> bool {
        *self == ConnectionStatus::Online
    }

    fn from_probe(online: bool) -> Self {
        if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }
}

/// Snapshot of the monitor's state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Instant of the last confirmed transition.
    pub last_change: DateTime<Utc>,
}

type StatusCallback = Arc<dyn Fn(ConnectionStatus, bool) + Send + Sync>;

struct MonitorInner {
    remote: Arc<dyn RemoteCatalog>,
    state: Mutex<ConnectionState>,
    /// Last low-level platform signal. May be wrong (captive portals);
    /// only a real probe promotes it to `Online`.
    link_up: AtomicBool,
    subscribers: Mutex<Vec<(u64, StatusCallback)>>,
    next_subscriber: AtomicU64,
    last_activity_probe: Mutex<Option<Instant>>,
    shutdown: Notify,
    shut_down: AtomicBool,
}

/// Explicitly constructed, injectable reachability monitor.
///
/// Cheap to clone; all clones share one state. Created once at application
/// start and passed by reference to consumers — there is no global
/// instance, so tests can run several independent monitors.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

/// Handle for a registered status listener.
///
/// `unsubscribe` is idempotent; dropping the handle does *not* remove the
/// listener — the owner decides when to unregister.
pub struct StatusSubscription {
    inner: Weak<MonitorInner>,
    id: u64,
}

impl StatusSubscription {
    /// Remove this listener. Safe to call any number of times, and safe
    /// while a notification round is in flight (the round runs over a
    /// snapshot of the list).
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Ok(mut subs) = inner.subscribers.lock() {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ConnectionMonitor {
    /// Create a monitor seeded from the platform's low-level link flag.
    ///
    /// The seed is cheap and may be wrong; the first probe corrects it.
    pub fn new(remote: Arc<dyn RemoteCatalog>, link_up: bool) -> Self {
        let status = ConnectionStatus::from_probe(link_up);
        Self {
            inner: Arc::new(MonitorInner {
                remote,
                state: Mutex::new(ConnectionState {
                    status,
                    last_change: Utc::now(),
                }),
                link_up: AtomicBool::new(link_up),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                last_activity_probe: Mutex::new(None),
                shutdown: Notify::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Current state snapshot.
    pub fn status(&self) -> ConnectionState {
        match self.inner.state.lock() {
            Ok(state) => *state,
            // Poisoning means a panic mid-update; report Offline rather
            // than a half-written state.
            Err(_) => ConnectionState {
                status: ConnectionStatus::Offline,
                last_change: Utc::now(),
            },
        }
    }

    /// Register a listener for confirmed transitions.
    ///
    /// Listeners are notified synchronously, in registration order, with
    /// `(status, is_online)`.
    pub fn subscribe(
        &self,
        callback: impl Fn(ConnectionStatus, bool) + Send + Sync + 'static,
    ) -> StatusSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push((id, Arc::new(callback)));
        }
        StatusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Probe immediately and return the freshly confirmed reachability.
    ///
    /// Never fails: probe errors *are* the `false` result.
    pub async fn force_check(&self) -> bool {
        let online = self.inner.probe().await;
        self.inner.apply(online);
        online
    }

    /// Platform reported the network interface went away.
    ///
    /// Trusted without a probe — the probe would only time out.
    pub fn link_went_down(&self) {
        self.inner.link_up.store(false, Ordering::Release);
        self.inner.apply(false);
    }

    /// Platform reported a network interface came up.
    ///
    /// Not trusted directly: wait for the interface to settle, then probe.
    pub fn link_went_up(&self) {
        self.inner.link_up.store(true, Ordering::Release);
        if self.inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.notified() => {}
                _ = tokio::time::sleep(LINK_UP_GRACE) => {
                    let online = inner.probe().await;
                    inner.apply(online);
                }
            }
        });
    }

    /// Opportunistic re-check on user activity (window focus, clicks).
    ///
    /// Rate-limited so a click storm cannot turn into a probe storm.
    pub fn activity_hint(&self) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        if !self.inner.claim_activity_probe() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let online = inner.probe().await;
            inner.apply(online);
        });
    }

    /// Start the background poll.
    ///
    /// Probes on a fixed interval regardless of platform signals, catching
    /// the cases the runtime never surfaces as events (server down, local
    /// link fine). Stops on [`shutdown`](Self::shutdown).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(POLL_INTERVAL);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                // A shutdown that lands while a probe is running must not
                // be lost when the loop re-subscribes to the notify.
                if inner.shut_down.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    _ = poll.tick() => {
                        let online = inner.probe().await;
                        inner.apply(online);
                    }
                }
            }
            tracing::debug!("connectivity poll stopped");
        })
    }

    /// Stop the poll and drop all listeners. No notification fires after
    /// this returns.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.shutdown.notify_waiters();
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.clear();
        }
    }
}

impl MonitorInner {
    /// One real reachability probe.
    ///
    /// Short-circuits to offline while the platform says there is no link
    /// at all; otherwise the health endpoint decides, bounded by
    /// [`PROBE_TIMEOUT`].
    async fn probe(&self) -> bool {
        if !self.link_up.load(Ordering::Acquire) {
            return false;
        }
        match tokio::time::timeout(PROBE_TIMEOUT, self.remote.fetch_health()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!("health probe timed out");
                false
            }
        }
    }

    /// Compare a probe result against the current status and transition if
    /// it differs. Unchanged results touch nothing — no timestamp update,
    /// no notification.
    fn apply(&self, online: bool) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        let status = ConnectionStatus::from_probe(online);
        let changed = match self.state.lock() {
            Ok(mut state) => {
                if state.status == status {
                    false
                } else {
                    state.status = status;
                    state.last_change = Utc::now();
                    true
                }
            }
            Err(_) => false,
        };

        if !changed {
            return;
        }

        tracing::info!(?status, "connection status changed");

        // Snapshot before delivering so unsubscription from inside a
        // callback cannot shift the list mid-iteration.
        let listeners: Vec<StatusCallback> = match self.subscribers.lock() {
            Ok(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(status, status.is_online());
        }
    }

    /// Reserve an activity-triggered probe slot; false while still inside
    /// the rate-limit window.
    fn claim_activity_probe(&self) -> bool {
        let Ok(mut last) = self.last_activity_probe.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < ACTIVITY_PROBE_MIN_GAP => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
