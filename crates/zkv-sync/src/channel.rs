//! Debounced, owner-scoped sync channel.
//!
//! ```text
//! snapshot stream ──▶ receiver task ──▶ latest-snapshot slot ──▶ processor task
//!                        │ (errors)                                 │
//!                        ▼                                          ▼
//!                    on_error                    decrypt in sub-batches ─▶ RecordCache ─▶ on_update
//! ```
//!
//! The slot holds one snapshot: a burst of arrivals collapses to the newest.
//! The processor handles one snapshot at a time and drops its result if a
//! newer one arrived meanwhile, so only the latest view is ever published.
//! A snapshot in which no record opens is reported to `on_error` and neither
//! cached nor published. Cancelling the subscription's token stops both
//! tasks, dropping any decryption in flight.

use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zkv_core::config::SyncConfig;
use zkv_core::types::Record;
use zkv_core::ZkvError;

use crate::cache::{CacheGeneration, RecordCache};
use crate::codec::open_record;
use crate::executor::CryptoTaskExecutor;
use crate::store::{Document, SnapshotStream};

pub type UpdateCallback = Arc<dyn Fn(Vec<Record>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ZkvError) + Send + Sync>;

/// Shared between the receiver and processor tasks.
#[derive(Default)]
struct PendingSnapshot {
    latest: Mutex<Option<(Vec<Document>, CacheGeneration)>>,
    notify: Notify,
    closed: AtomicBool,
}

impl PendingSnapshot {
    fn offer(&self, docs: Vec<Document>, generation: CacheGeneration) {
        if self.latest.lock().replace((docs, generation)).is_some() {
            debug!("superseding queued snapshot");
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<(Vec<Document>, CacheGeneration)> {
        self.latest.lock().take()
    }

    fn has_pending(&self) -> bool {
        self.latest.lock().is_some()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Builds subscriptions that turn encrypted snapshots into published records.
#[derive(Clone)]
pub struct SyncChannel {
    executor: Arc<CryptoTaskExecutor>,
    cache: Arc<RecordCache>,
    debounce: Duration,
    batch_size: usize,
}

impl SyncChannel {
    pub fn new(
        executor: Arc<CryptoTaskExecutor>,
        cache: Arc<RecordCache>,
        config: &SyncConfig,
    ) -> Self {
        SyncChannel {
            executor,
            cache,
            debounce: config.debounce(),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Start consuming `snapshots` for `owner_id` until `cancel` fires or
    /// the subscription is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        owner_id: &str,
        secret: SecretString,
        snapshots: SnapshotStream,
        on_update: UpdateCallback,
        on_error: ErrorCallback,
        cancel: CancellationToken,
    ) -> Subscription {
        let pending = Arc::new(PendingSnapshot::default());
        let processing = Arc::new(AtomicBool::new(false));

        let receiver = {
            let cancel = cancel.clone();
            let receiving = receive(
                snapshots,
                self.cache.clone(),
                owner_id.to_string(),
                pending.clone(),
                on_error.clone(),
            );
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("sync channel receiver cancelled"),
                    _ = receiving => {}
                }
            })
        };

        let processor = {
            let cancel = cancel.clone();
            let processing = processing.clone();
            let processor = Processor {
                channel: self.clone(),
                owner_id: owner_id.to_string(),
                secret,
                pending,
                processing: processing.clone(),
                cancel: cancel.clone(),
                on_update,
                on_error,
            };
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("sync channel processor cancelled"),
                    _ = processor.run() => {}
                }
                processing.store(false, Ordering::SeqCst);
            })
        };

        debug!(owner_id, "sync channel started");
        Subscription {
            tasks: vec![receiver, processor],
            processing,
            cancel,
        }
    }

    /// Decrypt a snapshot in sub-batches, yielding between them.
    ///
    /// Records that fail to open are logged and dropped.
    pub async fn decrypt_snapshot(
        &self,
        owner_id: &str,
        docs: Vec<Document>,
        secret: &SecretString,
    ) -> Vec<Record> {
        let total = docs.len();
        let mut records = Vec::with_capacity(total);
        let mut docs = docs.into_iter();
        let mut first = true;

        loop {
            let batch: Vec<Document> = docs.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            if !first {
                tokio::task::yield_now().await;
            }
            first = false;

            let opened = join_all(batch.into_iter().map(|doc| {
                let id = doc.id.clone();
                async move {
                    let result = open_record(&self.executor, owner_id, doc, secret).await;
                    (id, result)
                }
            }))
            .await;

            for (id, result) in opened {
                match result {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(owner_id, record_id = %id, error = %e, "dropping record that failed to open"),
                }
            }
        }

        if records.len() < total {
            debug!(owner_id, total, opened = records.len(), "snapshot partially decrypted");
        }
        records
    }
}

async fn receive(
    mut snapshots: SnapshotStream,
    cache: Arc<RecordCache>,
    owner_id: String,
    pending: Arc<PendingSnapshot>,
    on_error: ErrorCallback,
) {
    loop {
        // Taken before the snapshot is read so a write landing in between
        // keeps it out of the cache.
        let generation = cache.generation(&owner_id);
        let Some(item) = snapshots.next().await else {
            break;
        };
        match item {
            Ok(docs) => pending.offer(docs, generation),
            Err(e) => {
                warn!(error = %e, "snapshot stream error");
                on_error(as_sync_error(e));
            }
        }
    }
    debug!("snapshot stream ended");
    pending.close();
}

struct Processor {
    channel: SyncChannel,
    owner_id: String,
    secret: SecretString,
    pending: Arc<PendingSnapshot>,
    processing: Arc<AtomicBool>,
    cancel: CancellationToken,
    on_update: UpdateCallback,
    on_error: ErrorCallback,
}

impl Processor {
    async fn run(self) {
        let Processor {
            channel,
            owner_id,
            secret,
            pending,
            processing,
            cancel,
            on_update,
            on_error,
        } = self;

        loop {
            pending.notify.notified().await;

            // Restart the window on every arrival; only the last snapshot survives.
            loop {
                tokio::select! {
                    _ = pending.notify.notified() => {}
                    _ = tokio::time::sleep(channel.debounce) => break,
                }
            }

            let Some((docs, generation)) = pending.take() else {
                if pending.is_closed() {
                    break;
                }
                continue;
            };

            let total = docs.len();
            processing.store(true, Ordering::SeqCst);
            let records = channel.decrypt_snapshot(&owner_id, docs, &secret).await;
            processing.store(false, Ordering::SeqCst);

            if cancel.is_cancelled() {
                break;
            }
            if pending.has_pending() {
                debug!(owner_id = %owner_id, "newer snapshot pending; discarding processed view");
                continue;
            }

            if total > 0 && records.is_empty() {
                warn!(owner_id = %owner_id, total, "no record in snapshot opened");
                on_error(ZkvError::WrongSecretOrCorrupted);
            } else {
                channel.cache.set_if_current(&owner_id, generation, &records);
                on_update(records);
            }

            if pending.is_closed() && !pending.has_pending() {
                break;
            }
        }
        debug!(owner_id = %owner_id, "sync channel processor stopped");
    }
}

fn as_sync_error(e: ZkvError) -> ZkvError {
    match e {
        ZkvError::Sync(_) => e,
        other => ZkvError::Sync(other.to_string()),
    }
}

/// Handle to a running sync channel. Dropping it unsubscribes.
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
    processing: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Stop both tasks. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.processing.store(false, Ordering::SeqCst);
    }

    /// True while a snapshot is being decrypted.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Wrap a closure as an update callback.
pub fn on_update<F>(f: F) -> UpdateCallback
where
    F: Fn(Vec<Record>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as an error callback.
pub fn on_error<F>(f: F) -> ErrorCallback
where
    F: Fn(ZkvError) + Send + Sync + 'static,
{
    Arc::new(f)
}
