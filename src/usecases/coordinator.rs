//! Bounded queue decoupling download completion from publishing.
//!
//! Producers are the per-session download loops; consumers hand finished
//! units to the publish sink. Enqueueing never blocks the download pipeline
//! for more than the enqueue timeout: on timeout the unit is dropped and
//! logged.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::DownloadedItem;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One group's worth of downloaded media, queued for publishing. Units keep
/// group boundaries so the publisher can honor album atomicity.
#[derive(Debug)]
pub struct PublishUnit {
    pub group_id: String,
    pub session: String,
    pub is_album: bool,
    pub items: Vec<DownloadedItem>,
    /// Members that failed to download; a non-zero count truncates the
    /// group, which structure-preserving publishing refuses to publish.
    pub failed_members: usize,
}

/// Consumer side of the queue. The staged publisher is the production
/// implementation; tests use counting sinks.
#[async_trait::async_trait]
pub trait UnitSink: Send + Sync {
    async fn process(&self, unit: PublishUnit);

    /// Called on idle poll cycles; used for stale-batch flushing.
    async fn tick(&self) {}
}

enum QueueMessage {
    Unit(PublishUnit),
    Shutdown,
}

pub struct UploadCoordinator {
    tx: mpsc::Sender<QueueMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueMessage>>>,
    sink: Arc<dyn UnitSink>,
    consumer_count: usize,
    consumers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    pending: Arc<AtomicUsize>,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl UploadCoordinator {
    pub fn new(
        sink: Arc<dyn UnitSink>,
        queue_size: usize,
        consumer_count: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            sink,
            consumer_count: consumer_count.max(1),
            consumers: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
            cancel,
        }
    }

    /// Spawn the consumer workers.
    pub fn start(&self) {
        let mut consumers = self.consumers.lock().expect("consumer list poisoned");
        if !consumers.is_empty() {
            warn!("upload coordinator already started");
            return;
        }
        for worker in 0..self.consumer_count {
            let rx = Arc::clone(&self.rx);
            let sink = Arc::clone(&self.sink);
            let pending = Arc::clone(&self.pending);
            let cancel = self.cancel.clone();
            consumers.push(tokio::spawn(async move {
                consume_loop(worker, rx, sink, pending, cancel).await;
            }));
        }
        info!(consumers = self.consumer_count, "upload coordinator started");
    }

    /// Enqueue one unit with a bounded wait. On timeout the unit is dropped
    /// so the download pipeline never stalls on a slow publisher.
    pub async fn submit(&self, unit: PublishUnit) {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(group = %unit.group_id, "coordinator shutting down, dropping unit");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let group_id = unit.group_id.clone();
        self.pending.fetch_add(1, Ordering::SeqCst);
        match tokio::time::timeout(ENQUEUE_TIMEOUT, self.tx.send(QueueMessage::Unit(unit))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(group = %group_id, "upload queue closed, dropping unit");
            }
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(group = %group_id, "upload queue full, dropping unit");
            }
        }
    }

    pub fn dropped_units(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Orderly shutdown: wait for the queue to drain (bounded), wake every
    /// consumer with a sentinel, then cancel stragglers.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let drain_deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.pending.load(Ordering::SeqCst) > 0 {
            if self.cancel.is_cancelled() {
                break;
            }
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(
                    pending = self.pending.load(Ordering::SeqCst),
                    "queue drain timed out"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for _ in 0..self.consumer_count {
            // Consumers may already be gone; a failed send is fine.
            let _ = tokio::time::timeout(
                ENQUEUE_TIMEOUT,
                self.tx.send(QueueMessage::Shutdown),
            )
            .await;
        }

        let consumers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.consumers.lock().expect("consumer list poisoned"));
        for handle in consumers {
            let abort = handle.abort_handle();
            match tokio::time::timeout(CONSUMER_STOP_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("consumer did not stop in time, cancelling");
                    abort.abort();
                }
            }
        }
        info!(dropped = self.dropped_units(), "upload coordinator stopped");
    }
}

async fn consume_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueMessage>>>,
    sink: Arc<dyn UnitSink>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    info!(worker, "upload consumer started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let received = {
            let mut rx = rx.lock().await;
            tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await
        };
        match received {
            Err(_) => sink.tick().await,
            Ok(None) | Ok(Some(QueueMessage::Shutdown)) => break,
            Ok(Some(QueueMessage::Unit(unit))) => {
                sink.process(unit).await;
                pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    info!(worker, "upload consumer stopped");
}
