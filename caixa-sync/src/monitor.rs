//! Connection monitor: network signal plus periodic health probes.
//!
//! Two inputs feed the [`ConnectionState`]:
//!
//! - the host's network signal (a `watch` channel of "is the device online"),
//!   applied immediately in both directions;
//! - health probes through the [`ApiClient`], run on start, on every tick,
//!   whenever the network comes back, and when the queue reports that the
//!   server stopped answering.
//!
//! Probes may overlap. Each one is numbered when it starts and a result is
//! only applied if no later probe has already been applied, so `last_check`
//! never moves backwards.

use crate::api_client::ApiClient;
use crate::connectivity::Connectivity;
use crate::observer::{Listeners, Subscription};
use crate::types::{ConnectionState, ConnectionStatus};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

// ── Network signal ──

/// Sender side of the platform online/offline signal.
///
/// Hosts wire their platform events into it; tests flip it by hand.
#[derive(Debug)]
pub struct NetworkSignal {
    tx: watch::Sender<bool>,
}

impl NetworkSignal {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for NetworkSignal {
    fn default() -> Self {
        Self::new(true)
    }
}

// ── Monitor ──

struct ProbeState {
    current: ConnectionState,
    /// Sequence number of the newest probe whose result was applied.
    applied: u64,
}

struct MonitorInner {
    api: Arc<ApiClient>,
    state: Mutex<ProbeState>,
    listeners: Listeners<ConnectionState>,
    disposed: AtomicBool,
    next_probe: AtomicU64,
    in_flight: AtomicUsize,
}

/// Tracks whether the device is online and whether the server answers.
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// Starts monitoring: probes once right away, then every `interval`, and
    /// follows `network` until [`shutdown`](Self::shutdown).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        api: Arc<ApiClient>,
        mut network: watch::Receiver<bool>,
        interval: Duration,
    ) -> Self {
        let online = *network.borrow_and_update();
        let (url, _) = api.current_endpoint();

        let inner = Arc::new(MonitorInner {
            api,
            state: Mutex::new(ProbeState {
                current: ConnectionState::initial(online, url),
                applied: 0,
            }),
            listeners: Listeners::new(),
            disposed: AtomicBool::new(false),
            next_probe: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        });

        let interval = interval.max(MIN_PROBE_INTERVAL);
        let task_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut network_open = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task_inner.spawn_probe();
                    }
                    changed = network.changed(), if network_open => {
                        if changed.is_err() {
                            debug!("network signal closed; relying on probes only");
                            network_open = false;
                            continue;
                        }
                        let online = *network.borrow_and_update();
                        task_inner.set_online(online);
                    }
                }
            }
        });

        info!("connection monitor started, probing every {}ms", interval.as_millis());
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().current.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    pub fn is_api_available(&self) -> bool {
        self.inner.lock_state().current.is_api_available
    }

    /// Registers `listener`, calls it right away with the current state, and
    /// again after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let subscription = self.inner.listeners.add(listener.clone());
        (*listener)(&self.state());
        subscription
    }

    /// Probes now and returns the resulting state.
    pub async fn check_now(&self) -> ConnectionState {
        Arc::clone(&self.inner).probe().await;
        self.state()
    }

    /// Stops the timer and the network listener. Probes still in flight
    /// finish without touching the state.
    pub fn shutdown(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("connection monitor stopped");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Connectivity for ConnectionMonitor {
    fn on_server_unreachable(&self) {
        if self.inner.in_flight.load(Ordering::Acquire) > 0 {
            return;
        }
        debug!("queue reported server unreachable, re-probing");
        self.inner.spawn_probe();
    }
}

impl MonitorInner {
    fn spawn_probe(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        tokio::spawn(Arc::clone(self).probe());
    }

    fn set_online(self: &Arc<Self>, online: bool) {
        if self.is_disposed() {
            return;
        }

        if online {
            self.update(|state| state.is_online = true);
            info!("network is back, probing server");
            self.spawn_probe();
        } else {
            self.update(|state| {
                state.is_online = false;
                state.is_api_available = false;
                state.api_latency = None;
            });
            warn!("network lost");
        }
    }

    async fn probe(self: Arc<Self>) {
        if self.is_disposed() || !self.lock_state().current.is_online {
            return;
        }

        let seq = self.next_probe.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.update(|state| state.is_checking = true);

        let check = self.api.health_check().await;
        let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;

        if self.is_disposed() {
            return;
        }

        let (before, after) = {
            let mut guard = self.lock_state();
            let before = guard.current.status();
            guard.current.is_checking = remaining > 0;
            if seq > guard.applied {
                guard.applied = seq;
                let state = &mut guard.current;
                state.last_check = Some(Utc::now());
                // The network may have dropped while the probe was out.
                state.is_api_available = check.ok && state.is_online;
                state.api_latency = check.ok.then_some(check.latency_ms);
                state.current_url = check.url.clone();
                state.is_using_fallback = check.using_fallback;
            } else {
                debug!("discarding stale probe #{seq}");
            }
            (before, guard.current.clone())
        };

        self.listeners.notify(&after);

        let status = after.status();
        if status != before {
            match status {
                ConnectionStatus::Online => info!(
                    "server available at {} ({}ms{})",
                    after.current_url,
                    check.latency_ms,
                    if after.is_using_fallback { ", fallback" } else { "" }
                ),
                ConnectionStatus::ServerUnavailable => {
                    warn!("server unavailable at {}", after.current_url)
                }
                _ => debug!("connection status {status:?}"),
            }
        }
    }

    /// Applies `change` and notifies listeners with the result.
    fn update(&self, change: impl FnOnce(&mut ConnectionState)) {
        let snapshot = {
            let mut guard = self.lock_state();
            change(&mut guard.current);
            guard.current.clone()
        };
        self.listeners.notify(&snapshot);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
