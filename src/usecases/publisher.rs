//! Staged publisher: scratch-upload, batch assembly, multi-target fanout,
//! scratch cleanup.
//!
//! Stage 1 sends each downloaded item to the self-chat and captures the
//! issued file handle. Stage 2 assembles publish batches: in
//! structure-preserving mode one batch is exactly one original group; in
//! legacy mode items pack into kind-family batches of up to the batch size,
//! flushed when full or stale. Stage 3 fans each batch out to every target
//! channel with bounded concurrency and per-target retry. Stage 4 deletes
//! the scratch messages according to the cleanup flags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{
    DomainError, DownloadedItem, ItemPayload, KindFamily, Severity, StagedItem,
};
use crate::ports::{OutgoingMedia, PublishItem, SELF_CHAT};
use crate::shared::backoff::{with_retry, RetryPolicy};
use crate::usecases::coordinator::{PublishUnit, UnitSink};
use crate::usecases::session_pool::{PooledSession, SessionPool};
use crate::usecases::stats::StatsCollector;
use crate::usecases::template::TemplateEngine;

/// Platform cap on items per media-group send.
pub const MAX_BATCH: usize = 10;

/// Suffix appended when a caption is truncated to the account's cap.
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub targets: Vec<String>,
    /// Legacy-mode pack size, 1..=10.
    pub batch_size: usize,
    pub preserve_structure: bool,
    pub fanout_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub cleanup_after_success: bool,
    pub cleanup_after_failure: bool,
    /// Legacy batches older than this are flushed even when not full.
    pub stale_after: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            batch_size: MAX_BATCH,
            preserve_structure: false,
            fanout_concurrency: 3,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            cleanup_after_success: true,
            cleanup_after_failure: false,
            stale_after: Duration::from_secs(300),
        }
    }
}

/// A legacy-mode batch under assembly. Handles are session-bound, so pending
/// batches are keyed by (session, family) and never mix sessions.
struct PendingBatch {
    session: String,
    items: Vec<StagedItem>,
    created: Instant,
}

#[derive(Default)]
struct PendingBatches {
    by_key: HashMap<(String, KindFamily), PendingBatch>,
}

pub struct StagedPublisher {
    pool: Arc<SessionPool>,
    template: TemplateEngine,
    settings: PublisherSettings,
    stage_retry: RetryPolicy,
    cancel: CancellationToken,
    stats: Arc<StatsCollector>,
    fanout_limit: Arc<Semaphore>,
    pending: tokio::sync::Mutex<PendingBatches>,
}

impl StagedPublisher {
    pub fn new(
        pool: Arc<SessionPool>,
        template: TemplateEngine,
        settings: PublisherSettings,
        stage_retry: RetryPolicy,
        stats: Arc<StatsCollector>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let fanout_limit = Arc::new(Semaphore::new(settings.fanout_concurrency.max(1)));
        Arc::new(Self {
            pool,
            template,
            settings,
            stage_retry,
            cancel,
            stats,
            fanout_limit,
            pending: tokio::sync::Mutex::new(PendingBatches::default()),
        })
    }

    async fn publish_unit(&self, unit: PublishUnit) {
        if self.cancel.is_cancelled() {
            warn!(group = %unit.group_id, "cancelled, unit not published");
            return;
        }
        let Some(session) = self.pool.session(&unit.session) else {
            error!(group = %unit.group_id, session = %unit.session, "owning session not in pool");
            self.stats.record_publish_failed(unit.items.len() as u64);
            return;
        };

        if self.settings.preserve_structure {
            self.publish_structured(&session, unit).await;
        } else {
            self.publish_packed(&session, unit).await;
        }
    }

    /// Structure-preserving path: the unit is published as exactly one
    /// batch, or not at all.
    async fn publish_structured(&self, session: &Arc<PooledSession>, unit: PublishUnit) {
        if unit.is_album && unit.failed_members > 0 {
            warn!(
                group = %unit.group_id,
                missing = unit.failed_members,
                "group is incomplete, refusing to publish a truncated album"
            );
            self.count_publish_failure(session, unit.items.len());
            return;
        }

        let mut staged = Vec::with_capacity(unit.items.len());
        for item in &unit.items {
            match self.stage_item(session, item).await {
                Ok(staged_item) => staged.push(staged_item),
                Err(e) => {
                    self.stats.record_error(&e, Severity::Error, format!("stage msg {}", item.message_id));
                    error!(
                        group = %unit.group_id,
                        msg_id = item.message_id,
                        error = %e,
                        "scratch upload failed, aborting group"
                    );
                    // A truncated album must not reach any target.
                    self.cleanup(session, &staged, false).await;
                    self.count_publish_failure(session, unit.items.len());
                    return;
                }
            }
        }
        if staged.is_empty() {
            return;
        }
        let delivered = self.fanout(session, &staged).await;
        self.cleanup(session, &staged, delivered).await;
        if delivered {
            session.record_publish(true);
            self.stats.record_published(staged.len() as u64);
        } else {
            self.count_publish_failure(session, staged.len());
        }
    }

    /// Legacy path: stage items individually and pack them into kind-family
    /// batches; full batches ship immediately.
    async fn publish_packed(&self, session: &Arc<PooledSession>, unit: PublishUnit) {
        for item in &unit.items {
            let staged_item = match self.stage_item(session, item).await {
                Ok(staged_item) => staged_item,
                Err(e) => {
                    self.stats.record_error(&e, Severity::Error, format!("stage msg {}", item.message_id));
                    error!(msg_id = item.message_id, error = %e, "scratch upload failed, item skipped");
                    self.count_publish_failure(session, 1);
                    continue;
                }
            };

            let ready = {
                let mut pending = self.pending.lock().await;
                let key = (session.name.clone(), staged_item.kind.spec().family);
                let batch = pending.by_key.entry(key.clone()).or_insert_with(|| PendingBatch {
                    session: session.name.clone(),
                    items: Vec::new(),
                    created: Instant::now(),
                });
                batch.items.push(staged_item);
                if batch.items.len() >= self.settings.batch_size.min(MAX_BATCH) {
                    pending.by_key.remove(&key)
                } else {
                    None
                }
            };
            if let Some(batch) = ready {
                self.ship_batch(batch).await;
            }
        }
    }

    /// Flush legacy batches that outlived the stale timeout. Driven by idle
    /// consumer polls.
    pub async fn flush_stale(&self) {
        let stale: Vec<PendingBatch> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<_> = pending
                .by_key
                .iter()
                .filter(|(_, batch)| batch.created.elapsed() >= self.settings.stale_after)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter().filter_map(|key| pending.by_key.remove(&key)).collect()
        };
        for batch in stale {
            info!(items = batch.items.len(), "flushing stale batch");
            self.ship_batch(batch).await;
        }
    }

    /// Flush everything still pending; called at end of run.
    pub async fn flush_all(&self) {
        let remaining: Vec<PendingBatch> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<_> = pending.by_key.keys().cloned().collect();
            keys.into_iter().filter_map(|key| pending.by_key.remove(&key)).collect()
        };
        for batch in remaining {
            self.ship_batch(batch).await;
        }
    }

    async fn ship_batch(&self, batch: PendingBatch) {
        let Some(session) = self.pool.session(&batch.session) else {
            error!(session = %batch.session, "owning session not in pool, batch lost");
            self.stats.record_publish_failed(batch.items.len() as u64);
            return;
        };
        let delivered = self.fanout(&session, &batch.items).await;
        self.cleanup(&session, &batch.items, delivered).await;
        if delivered {
            session.record_publish(true);
            self.stats.record_published(batch.items.len() as u64);
        } else {
            self.count_publish_failure(&session, batch.items.len());
        }
    }

    /// Stage 1: upload one item to the self-chat and capture its handle.
    /// Transient failures back off under the retry policy.
    async fn stage_item(
        &self,
        session: &Arc<PooledSession>,
        item: &DownloadedItem,
    ) -> Result<StagedItem, DomainError> {
        let caption = self.caption_for(session, item);
        let bytes = match &item.payload {
            ItemPayload::InMemory { bytes, .. } => bytes.clone(),
            ItemPayload::OnDisk { path, .. } => tokio::fs::read(path).await?,
        };

        let staged = with_retry(&self.stage_retry, &self.cancel, "scratch upload", || {
            let media = OutgoingMedia {
                kind: item.kind,
                bytes: bytes.clone(),
                file_name: item.file_name.clone(),
                caption: caption.clone(),
                meta: item.meta,
            };
            async move {
                let _guard = session.reserve().await;
                session.gateway.send_media(SELF_CHAT, media).await
            }
        })
        .await?;

        Ok(StagedItem {
            origin_message_id: item.message_id,
            scratch_message_id: staged.message_id,
            file_ref: staged.file_ref,
            kind: item.kind,
            caption,
            meta: item.meta,
        })
    }

    /// Rendered caption truncated to the account tier's cap; kinds whose
    /// send method takes no caption get none.
    fn caption_for(&self, session: &PooledSession, item: &DownloadedItem) -> Option<String> {
        if !item.kind.spec().supports_caption {
            return None;
        }
        let rendered = self.template.render(item, &HashMap::new());
        if rendered.is_empty() {
            return None;
        }
        let cap = session.caption_limit();
        if rendered.chars().count() <= cap {
            return Some(rendered);
        }
        let truncated: String = rendered.chars().take(cap - ELLIPSIS.len()).collect();
        Some(format!("{truncated}{ELLIPSIS}"))
    }

    /// Stage 3: one media-group send per target channel, concurrency bounded,
    /// with per-target retry. Returns true when every target succeeded.
    async fn fanout(&self, session: &Arc<PooledSession>, batch: &[StagedItem]) -> bool {
        let items: Vec<PublishItem> = batch
            .iter()
            .map(|staged| PublishItem {
                kind: staged.kind,
                file_ref: staged.file_ref.clone(),
                caption: staged.caption.clone(),
                meta: staged.meta,
            })
            .collect();

        let mut tasks = JoinSet::new();
        for target in &self.settings.targets {
            let target = target.clone();
            let items = items.clone();
            let session = Arc::clone(session);
            let limit = Arc::clone(&self.fanout_limit);
            let cancel = self.cancel.clone();
            let attempts = self.settings.retry_attempts;
            let retry_delay = self.settings.retry_delay;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore closed");
                let ok =
                    send_to_target(&session, &target, &items, attempts, retry_delay, &cancel).await;
                (target, ok)
            });
        }

        let mut all_ok = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(ids))) => {
                    info!(target = %target, messages = ids.len(), "batch published");
                }
                Ok((target, Err(e))) => {
                    all_ok = false;
                    self.stats.record_error(&e, Severity::Error, format!("publish to {target}"));
                    error!(target = %target, error = %e, "batch failed for target");
                }
                Err(e) => {
                    all_ok = false;
                    error!(error = %e, "fanout task panicked");
                }
            }
        }
        all_ok
    }

    /// Stage 4: delete the scratch messages; batch delete first, per-item
    /// fallback on error.
    async fn cleanup(&self, session: &Arc<PooledSession>, batch: &[StagedItem], delivered: bool) {
        let wanted = if delivered {
            self.settings.cleanup_after_success
        } else {
            self.settings.cleanup_after_failure
        };
        if !wanted || batch.is_empty() {
            return;
        }
        let ids: Vec<i32> = batch.iter().map(|staged| staged.scratch_message_id).collect();
        let batch_delete = {
            let _guard = session.reserve().await;
            session.gateway.delete_messages(SELF_CHAT, &ids).await
        };
        if let Err(e) = batch_delete {
            warn!(error = %e, "batch scratch delete failed, deleting one by one");
            for id in ids {
                let _guard = session.reserve().await;
                if let Err(e) = session.gateway.delete_messages(SELF_CHAT, &[id]).await {
                    warn!(scratch_id = id, error = %e, "scratch delete failed");
                }
            }
        }
    }

    fn count_publish_failure(&self, session: &PooledSession, items: usize) {
        session.record_publish(false);
        self.stats.record_publish_failed(items as u64);
    }
}

/// Per-target delivery: up to `attempts` tries spaced by `retry_delay`; a
/// flood wait sleeps the instructed seconds without consuming an attempt;
/// permission denials fail the target immediately.
async fn send_to_target(
    session: &PooledSession,
    target: &str,
    items: &[PublishItem],
    attempts: u32,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<i32>, DomainError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(DomainError::Cancelled);
        }
        let sent = {
            let _guard = session.reserve().await;
            session.gateway.send_media_group(target, items).await
        };
        match sent {
            Ok(ids) => return Ok(ids),
            Err(DomainError::FloodWait { seconds }) => {
                warn!(target, wait_secs = seconds, "flood wait on publish, sleeping");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                    _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                }
            }
            Err(e @ DomainError::Permission(_)) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
                warn!(
                    target,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "publish attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl UnitSink for StagedPublisher {
    async fn process(&self, unit: PublishUnit) {
        self.publish_unit(unit).await;
    }

    async fn tick(&self) {
        self.flush_stale().await;
    }
}
