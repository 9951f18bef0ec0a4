//! Durable mutation queue with bounded retries.
//!
//! Every write that the server has not confirmed lives in the store's `queue`
//! partition until a drain pass delivers it. A pass sends operations one at a
//! time in insertion order, so later mutations of a resource never overtake
//! earlier ones:
//!
//! ```text
//! pending --drain--> syncing --accepted--> (removed)
//!                    syncing --rejected--> pending   (retry_count < max)
//!                    syncing --rejected--> error     (retry_count == max)
//! ```
//!
//! Only one pass runs at a time. A pass requested while another is in flight
//! returns [`DrainResult::skipped`] immediately; `retry` and `retry_all`
//! instead wait for the running pass and then run their own.
//!
//! A pass works from the list taken when it started, but every state change
//! is a read-modify-write of the stored entry. Entries removed or reset while
//! the pass runs are never written back.

use crate::api_client::{ApiClient, SYNC_ENDPOINT};
use crate::connectivity::{Connectivity, Unmonitored};
use crate::error::{SyncError, SyncResult};
use crate::observer::{Listeners, Subscription};
use crate::types::*;
use caixa_store::{Partition, PersistentStore};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_AUTO_SYNC_INTERVAL: Duration = Duration::from_millis(1);

struct QueueInner {
    store: PersistentStore,
    api: Arc<ApiClient>,
    connectivity: Arc<dyn Connectivity>,
    processing: AtomicBool,
    /// Signalled whenever a pass releases the drain slot.
    idle: Notify,
    listeners: Listeners<Vec<SyncOperation>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let slot = self.auto_sync.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

/// Owner of the persisted mutation queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

/// Holds the single drain slot; released on drop, including cancellation.
struct DrainGuard<'a> {
    inner: &'a QueueInner,
}

impl<'a> DrainGuard<'a> {
    fn acquire(inner: &'a QueueInner) -> Option<Self> {
        inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inner })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.inner.processing.store(false, Ordering::Release);
        self.inner.idle.notify_waiters();
    }
}

impl SyncQueue {
    /// Creates the queue. Without a `connectivity` collaborator, unreachable
    /// failures are simply counted.
    pub fn new(
        store: PersistentStore,
        api: Arc<ApiClient>,
        connectivity: Option<Arc<dyn Connectivity>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                api,
                connectivity: connectivity.unwrap_or_else(|| Arc::new(Unmonitored)),
                processing: AtomicBool::new(false),
                idle: Notify::new(),
                listeners: Listeners::new(),
                auto_sync: Mutex::new(None),
            }),
        }
    }

    // ── Enqueue & inspection ──

    /// Records a mutation. `payload` must be a JSON object.
    ///
    /// While auto-sync is armed, a drain pass is scheduled in the background.
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        table: impl Into<String>,
        payload: Value,
        local_id: Option<String>,
    ) -> SyncResult<SyncOperation> {
        let Value::Object(payload) = payload else {
            return Err(SyncError::InvalidPayload(
                "sync payload must be a JSON object".to_string(),
            ));
        };

        let op = SyncOperation::new(op_type, table, payload, local_id);
        self.persist(&op).await?;
        debug!("queued {:?} on {} as {}", op.op_type, op.table, op.id);
        self.notify().await;

        if self.is_auto_syncing() {
            let queue = self.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.process_queue().await {
                    warn!("drain after enqueue failed: {e}");
                }
            });
        }
        Ok(op)
    }

    /// All queued operations in insertion order.
    pub async fn list(&self) -> SyncResult<Vec<SyncOperation>> {
        Ok(self.inner.store.list_json(Partition::Queue).await?)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<SyncOperation>> {
        Ok(self.inner.store.get_json(Partition::Queue, id).await?)
    }

    pub async fn len(&self) -> SyncResult<usize> {
        Ok(self.inner.store.count(Partition::Queue).await?)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        self.count_with(OperationStatus::Pending).await
    }

    pub async fn error_count(&self) -> SyncResult<usize> {
        self.count_with(OperationStatus::Error).await
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    // ── Drain ──

    /// Attempts delivery of every pending, errored, or stranded operation.
    pub async fn process_queue(&self) -> SyncResult<DrainResult> {
        let Some(guard) = DrainGuard::acquire(&self.inner) else {
            debug!("drain already in progress, skipping");
            return Ok(DrainResult::skipped());
        };
        self.drain(guard).await
    }

    /// Like [`process_queue`](Self::process_queue), but waits out a running
    /// pass instead of skipping, so the caller's changes are always drained.
    async fn drain_when_idle(&self) -> SyncResult<DrainResult> {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if let Some(guard) = DrainGuard::acquire(&self.inner) {
                return self.drain(guard).await;
            }
            debug!("drain in progress, queuing another pass");
            idle.await;
        }
    }

    async fn drain(&self, _guard: DrainGuard<'_>) -> SyncResult<DrainResult> {
        let batch: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(SyncOperation::is_drainable)
            .map(|op| op.id)
            .collect();
        if batch.is_empty() {
            return Ok(DrainResult::default());
        }

        let max_retries = self.inner.api.config().retry_attempts;
        info!("draining {} queued operations", batch.len());

        let mut result = DrainResult::default();
        for id in &batch {
            self.deliver(id, max_retries, &mut result).await;
        }

        self.notify().await;
        if result.success {
            info!("drain finished: {} synced", result.synced_count);
        } else {
            warn!(
                "drain finished: {} synced, {} failed",
                result.synced_count, result.failed_count
            );
        }
        Ok(result)
    }

    async fn deliver(&self, id: &str, max_retries: u32, result: &mut DrainResult) {
        let marked = self
            .inner
            .store
            .update_json(Partition::Queue, id, |op: &mut SyncOperation| {
                op.status = OperationStatus::Syncing;
                true
            })
            .await;
        let op = match marked {
            Ok(Some(op)) => op,
            Ok(None) => {
                debug!("{id} left the queue before it was sent");
                return;
            }
            Err(e) => {
                warn!("could not mark {id} as syncing: {e}");
                result.record_failure(id, e.to_string());
                return;
            }
        };
        self.notify().await;

        let response = match serde_json::to_value(&op) {
            Ok(body) => {
                self.inner
                    .api
                    .post(SYNC_ENDPOINT, json!({ "operations": [body] }))
                    .await
            }
            Err(e) => ApiResponse::failure(0, format!("could not encode operation: {e}")),
        };

        let unreachable = response.is_unreachable();
        match response.error {
            None => {
                // Delivered. A failed delete only means a duplicate send later.
                if let Err(e) = self.inner.store.delete(Partition::Queue, id).await {
                    warn!("synced {id} but could not remove it: {e}");
                }
                debug!("synced {id} ({} {})", op.table, response.status);
                result.record_success();
            }
            Some(message) => {
                if unreachable {
                    self.inner.connectivity.on_server_unreachable();
                }

                let error = message.clone();
                let recorded = self
                    .inner
                    .store
                    .update_json(Partition::Queue, id, move |op: &mut SyncOperation| {
                        // Reset by a retry while the send was out: keep the reset.
                        if op.status != OperationStatus::Syncing {
                            return false;
                        }
                        op.retry_count = op.retry_count.saturating_add(1).min(max_retries);
                        op.status = if op.retry_count >= max_retries {
                            OperationStatus::Error
                        } else {
                            OperationStatus::Pending
                        };
                        op.error_message = Some(error);
                        true
                    })
                    .await;

                match recorded {
                    Ok(Some(op)) => warn!(
                        "sync of {id} failed, now {} ({}/{max_retries}): {message}",
                        op.status, op.retry_count
                    ),
                    Ok(None) => debug!("{id} was removed while its send was in flight"),
                    Err(e) => warn!("could not record failure for {id}: {e}"),
                }
                result.record_failure(id, message);
            }
        }
    }

    // ── Manual operations ──

    /// Resets one operation to a fresh pending state and drains, waiting for
    /// a pass already in flight to finish first.
    pub async fn retry(&self, id: &str) -> SyncResult<DrainResult> {
        self.inner
            .store
            .update_json(Partition::Queue, id, |op: &mut SyncOperation| {
                op.reset();
                true
            })
            .await?
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        info!("retrying {id}");
        self.notify().await;
        self.drain_when_idle().await
    }

    /// Resets every `error` operation and drains, like [`retry`](Self::retry).
    pub async fn retry_all(&self) -> SyncResult<DrainResult> {
        let failed: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Error)
            .map(|op| op.id)
            .collect();
        info!("retrying {} failed operations", failed.len());
        for id in &failed {
            self.inner
                .store
                .update_json(Partition::Queue, id, |op: &mut SyncOperation| {
                    if op.status != OperationStatus::Error {
                        return false;
                    }
                    op.reset();
                    true
                })
                .await?;
        }
        self.notify().await;
        self.drain_when_idle().await
    }

    /// Deletes one operation without sending it.
    pub async fn remove(&self, id: &str) -> SyncResult<bool> {
        let removed = self.inner.store.delete(Partition::Queue, id).await?;
        if removed {
            info!("removed {id} from sync queue");
            self.notify().await;
        }
        Ok(removed)
    }

    /// Drops every queued operation. Unsent mutations are lost.
    pub async fn clear(&self) -> SyncResult<()> {
        self.inner.store.clear(Partition::Queue).await?;
        warn!("sync queue cleared");
        self.notify().await;
        Ok(())
    }

    // ── Auto-sync ──

    /// Drains now and then every `every` until stopped. Re-arming replaces the timer.
    pub fn start_auto_sync(&self, every: Duration) {
        let every = every.max(MIN_AUTO_SYNC_INTERVAL);
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = SyncQueue { inner };
                if let Err(e) = queue.process_queue().await {
                    warn!("auto-sync pass failed: {e}");
                }
            }
        });

        if let Some(previous) = self.lock_auto_sync().replace(handle) {
            previous.abort();
        }
        info!("auto-sync armed every {}ms", every.as_millis());
    }

    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.lock_auto_sync().take() {
            handle.abort();
            info!("auto-sync stopped");
        }
    }

    pub fn is_auto_syncing(&self) -> bool {
        self.lock_auto_sync()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // ── Observers ──

    /// Registers `listener`, calls it right away with the current queue, and
    /// again after every change.
    pub async fn subscribe<F>(&self, listener: F) -> SyncResult<Subscription>
    where
        F: Fn(&Vec<SyncOperation>) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let subscription = self.inner.listeners.add(listener.clone());
        match self.list().await {
            Ok(ops) => {
                (*listener)(&ops);
                Ok(subscription)
            }
            Err(e) => {
                subscription.unsubscribe();
                Err(e)
            }
        }
    }

    // ── Internals ──

    async fn persist(&self, op: &SyncOperation) -> SyncResult<()> {
        self.inner
            .store
            .set_json(Partition::Queue, &op.id, op, None)
            .await?;
        Ok(())
    }

    async fn notify(&self) {
        if self.inner.listeners.is_empty() {
            return;
        }
        match self.list().await {
            Ok(ops) => self.inner.listeners.notify(&ops),
            Err(e) => warn!("could not load queue for subscribers: {e}"),
        }
    }

    async fn count_with(&self, status: OperationStatus) -> SyncResult<usize> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|op| op.status == status)
            .count())
    }

    fn lock_auto_sync(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
