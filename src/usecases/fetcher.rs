//! Parallel message fetcher: reads a contiguous id window with up to K
//! sessions, each driving batched reads over its own disjoint sub-range.
//!
//! Output is merged and sorted by id; platform-empty ids simply produce no
//! entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{DomainError, Message};
use crate::usecases::session_pool::PooledSession;

/// Pause between consecutive batch calls within one worker.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Per-worker start offset so the first bursts across sessions do not align.
const WORKER_STAGGER: Duration = Duration::from_millis(200);

pub struct MessageFetcher {
    batch_size: usize,
    batch_pause: Duration,
    worker_stagger: Duration,
    cancel: CancellationToken,
}

impl MessageFetcher {
    pub fn new(batch_size: usize, cancel: CancellationToken) -> Self {
        Self {
            batch_size: batch_size.clamp(1, 200),
            batch_pause: BATCH_PAUSE,
            worker_stagger: WORKER_STAGGER,
            cancel,
        }
    }

    #[cfg(test)]
    fn without_pauses(batch_size: usize, cancel: CancellationToken) -> Self {
        Self {
            batch_size: batch_size.clamp(1, 200),
            batch_pause: Duration::ZERO,
            worker_stagger: Duration::ZERO,
            cancel,
        }
    }

    /// Fetch the inclusive id window `[start, end]` using every given
    /// session in parallel. Failed batches are skipped, never retried more
    /// than the single post-flood-wait attempt.
    pub async fn fetch_range(
        &self,
        sessions: &[Arc<PooledSession>],
        channel: &str,
        start_id: i32,
        end_id: i32,
    ) -> Result<Vec<Message>, DomainError> {
        if sessions.is_empty() {
            return Err(DomainError::Config("no sessions available for fetching".into()));
        }
        if start_id > end_id {
            return Err(DomainError::Validation(format!(
                "invalid id range {start_id}..{end_id}"
            )));
        }

        let ranges = split_range(start_id, end_id, sessions.len());
        info!(
            channel,
            start_id,
            end_id,
            workers = ranges.len(),
            "fetching message window"
        );

        let mut tasks = JoinSet::new();
        for (index, (session, range)) in sessions.iter().zip(ranges).enumerate() {
            if range.is_empty() {
                continue;
            }
            let session = Arc::clone(session);
            let channel = channel.to_string();
            let cancel = self.cancel.clone();
            let batch_size = self.batch_size;
            let batch_pause = self.batch_pause;
            let stagger = self.worker_stagger * index as u32;
            tasks.spawn(async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                fetch_worker(&session, &channel, &range, batch_size, batch_pause, &cancel).await
            });
        }

        let mut messages = Vec::new();
        let mut worker_failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(worker_messages) => messages.extend(worker_messages),
                Err(e) => {
                    worker_failures += 1;
                    error!(error = %e, "fetch worker panicked");
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(DomainError::Cancelled);
        }

        messages.sort_by_key(|m| m.id);
        info!(
            fetched = messages.len(),
            requested = (end_id - start_id + 1) as usize,
            worker_failures,
            "message window fetched"
        );
        Ok(messages)
    }
}

/// Split `[start, end]` into `parts` contiguous sub-ranges; earlier ranges
/// absorb the remainder of the integer division.
fn split_range(start_id: i32, end_id: i32, parts: usize) -> Vec<Vec<i32>> {
    let ids: Vec<i32> = (start_id..=end_id).collect();
    let per_part = ids.len() / parts;
    let remainder = ids.len() % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut cursor = 0usize;
    for index in 0..parts {
        let extra = usize::from(index < remainder);
        let next = cursor + per_part + extra;
        ranges.push(ids[cursor..next].to_vec());
        cursor = next;
    }
    ranges
}

async fn fetch_worker(
    session: &PooledSession,
    channel: &str,
    ids: &[i32],
    batch_size: usize,
    batch_pause: Duration,
    cancel: &CancellationToken,
) -> Vec<Message> {
    let mut guard = session.reserve().await;
    let mut collected = Vec::with_capacity(ids.len());

    for batch in ids.chunks(batch_size) {
        if cancel.is_cancelled() {
            warn!(session = %session.name, "fetch cancelled between batches");
            break;
        }

        match fetch_batch(session, channel, batch).await {
            Ok(valid) => {
                let invalid = batch.len().saturating_sub(valid.len());
                if invalid > 0 {
                    warn!(
                        session = %session.name,
                        batch_start = batch[0],
                        invalid,
                        "batch contained invalid messages"
                    );
                }
                collected.extend(valid);
            }
            Err(e) => {
                guard.mark_failed();
                error!(
                    session = %session.name,
                    batch_start = batch[0],
                    batch_end = batch[batch.len() - 1],
                    error = %e,
                    "batch failed, skipping"
                );
            }
        }

        if !batch_pause.is_zero() {
            tokio::time::sleep(batch_pause).await;
        }
    }

    info!(
        session = %session.name,
        fetched = collected.len(),
        assigned = ids.len(),
        "fetch worker finished"
    );
    collected
}

/// One batch read. A flood wait sleeps exactly the instructed seconds and
/// retries the same batch once; a second failure surfaces to the caller.
async fn fetch_batch(
    session: &PooledSession,
    channel: &str,
    ids: &[i32],
) -> Result<Vec<Message>, DomainError> {
    match session.gateway.get_messages(channel, ids).await {
        Ok(messages) => Ok(messages),
        Err(DomainError::FloodWait { seconds }) => {
            warn!(session = %session.name, wait_secs = seconds, "flood wait mid-fetch, retrying batch");
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            session.gateway.get_messages(channel, ids).await
        }
        Err(e) => Err(e),
    }
}
