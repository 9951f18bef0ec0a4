//! Application-level wiring of client, queue and monitor.
//!
//! One [`SyncRuntime`] is built at startup and handed to every consumer.
//! Auto-sync follows server availability: it is armed when the monitor sees
//! the server come up and disarmed when it goes away.

use crate::api_client::ApiClient;
use crate::cache::ResponseCache;
use crate::config::ApiConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncResult;
use crate::monitor::ConnectionMonitor;
use crate::observer::Subscription;
use crate::queue::SyncQueue;
use caixa_store::PersistentStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::info;

/// The sync subsystem, fully wired.
pub struct SyncRuntime {
    store: PersistentStore,
    api: Arc<ApiClient>,
    queue: SyncQueue,
    monitor: Arc<ConnectionMonitor>,
    availability: Mutex<Option<Subscription>>,
}

impl SyncRuntime {
    /// Loads the persisted configuration and starts everything.
    pub async fn start(store: PersistentStore, network: watch::Receiver<bool>) -> SyncResult<Self> {
        let config = ApiConfig::load(&store).await?;
        Self::start_with_config(store, config, network)
    }

    /// Starts with an explicit configuration, leaving the stored one untouched.
    pub fn start_with_config(
        store: PersistentStore,
        config: ApiConfig,
        network: watch::Receiver<bool>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let probe_every = config.health_check_interval();
        let sync_every = config.sync_interval();

        let api = Arc::new(ApiClient::new(config, ResponseCache::new(store.clone()))?);
        let monitor = Arc::new(ConnectionMonitor::start(Arc::clone(&api), network, probe_every));
        let connectivity: Arc<dyn Connectivity> = monitor.clone();
        let queue = SyncQueue::new(store.clone(), Arc::clone(&api), Some(connectivity));

        let armed = AtomicBool::new(false);
        let auto_sync = queue.clone();
        let subscription = monitor.subscribe(move |state| {
            let available = state.is_api_available;
            if armed.swap(available, Ordering::AcqRel) == available {
                return;
            }
            if available {
                auto_sync.start_auto_sync(sync_every);
            } else {
                auto_sync.stop_auto_sync();
            }
        });

        info!("sync runtime started against {}", api.current_endpoint().0);
        Ok(Self {
            store,
            api,
            queue,
            monitor,
            availability: Mutex::new(Some(subscription)),
        })
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Persists `config` and applies it to the running client.
    ///
    /// Interval changes take effect on the next start.
    pub async fn update_config(&self, config: ApiConfig) -> SyncResult<()> {
        config.save(&self.store).await?;
        self.api.set_config(config)
    }

    /// Stops the probe timer and auto-sync.
    pub fn shutdown(&self) {
        let subscription = self
            .availability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.monitor.shutdown();
        self.queue.stop_auto_sync();
        info!("sync runtime stopped");
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        let running = self
            .availability
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            self.shutdown();
        }
    }
}
