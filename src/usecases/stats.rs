//! Run statistics: counters, periodic progress, final report, exit code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{DomainError, ErrorCategory, ErrorRecord, Severity};
use crate::shared::files::format_size;
use crate::usecases::session_pool::SessionPool;

/// Interval between periodic progress summaries.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Retained error records; counters keep counting past the cap.
const MAX_ERROR_RECORDS: usize = 1000;

#[derive(Default)]
pub struct StatsCollector {
    targeted: AtomicU64,
    downloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
    cancelled: AtomicBool,
    errors: Mutex<ErrorLog>,
    started: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct ErrorLog {
    by_category: HashMap<ErrorCategory, u64>,
    records: Vec<ErrorRecord>,
}

impl StatsCollector {
    pub fn new() -> Arc<Self> {
        let collector = Arc::new(Self::default());
        *collector.started.lock().expect("stats poisoned") = Some(Instant::now());
        collector
    }

    pub fn set_targeted(&self, count: u64) {
        self.targeted.store(count, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, count: u64) {
        self.published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_publish_failed(&self, count: u64) {
        self.publish_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Record a handled error: category counter plus a bounded structured
    /// log entry.
    pub fn record_error(&self, error: &DomainError, severity: Severity, context: impl Into<String>) {
        let record = ErrorRecord::new(error, severity, context);
        let mut log = self.errors.lock().expect("stats poisoned");
        *log.by_category.entry(record.category).or_insert(0) += 1;
        if log.records.len() < MAX_ERROR_RECORDS {
            log.records.push(record);
        }
    }

    pub fn error_count(&self, category: ErrorCategory) -> u64 {
        self.errors
            .lock()
            .expect("stats poisoned")
            .by_category
            .get(&category)
            .copied()
            .unwrap_or(0)
    }

    fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .expect("stats poisoned")
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn log_progress(&self) {
        let targeted = self.targeted.load(Ordering::Relaxed);
        let done = self.downloaded.load(Ordering::Relaxed) + self.skipped.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        let percent = if targeted > 0 { done as f64 / targeted as f64 * 100.0 } else { 0.0 };
        info!(
            progress = format!("{done}/{targeted} ({percent:.1}%)"),
            failed,
            downloaded = %format_size(bytes),
            elapsed_secs = self.elapsed().as_secs(),
            "progress"
        );
    }

    /// Periodic progress reporter; stops on cancellation.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REPORT_INTERVAL) => stats.log_progress(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn final_report(&self, pool: &SessionPool) -> RunReport {
        let elapsed = self.elapsed();
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        let throughput_mbps = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 * 8.0 / 1_000_000.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let log = self.errors.lock().expect("stats poisoned");
        let errors_by_category = log
            .by_category
            .iter()
            .map(|(category, count)| (category.as_str(), *count))
            .collect();

        let per_session = pool
            .sessions()
            .iter()
            .map(|session| SessionReport {
                name: session.name.clone(),
                downloads_ok: session.counters.downloads_ok.load(Ordering::Relaxed),
                downloads_failed: session.counters.downloads_failed.load(Ordering::Relaxed),
                downloads_skipped: session.counters.downloads_skipped.load(Ordering::Relaxed),
                publishes_ok: session.counters.publishes_ok.load(Ordering::Relaxed),
                publishes_failed: session.counters.publishes_failed.load(Ordering::Relaxed),
                bytes_downloaded: session.counters.bytes_downloaded.load(Ordering::Relaxed),
            })
            .collect();

        RunReport {
            targeted: self.targeted.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            bytes_downloaded: bytes,
            elapsed,
            throughput_mbps,
            errors_by_category,
            per_session,
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub name: String,
    pub downloads_ok: u64,
    pub downloads_failed: u64,
    pub downloads_skipped: u64,
    pub publishes_ok: u64,
    pub publishes_failed: u64,
    pub bytes_downloaded: u64,
}

#[derive(Debug)]
pub struct RunReport {
    pub targeted: u64,
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub published: u64,
    pub publish_failed: u64,
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
    pub throughput_mbps: f64,
    pub errors_by_category: HashMap<&'static str, u64>,
    pub per_session: Vec<SessionReport>,
    pub cancelled: bool,
}

impl RunReport {
    /// Share of targeted files that ended up present locally (fresh or
    /// already there). An empty target set counts as full success.
    pub fn success_ratio(&self) -> f64 {
        if self.targeted == 0 {
            return 1.0;
        }
        (self.downloaded + self.skipped) as f64 / self.targeted as f64
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return 130;
        }
        let ratio = self.success_ratio();
        if ratio >= 0.95 {
            0
        } else if ratio >= 0.80 {
            1
        } else {
            2
        }
    }

    pub fn log_summary(&self) {
        info!(
            targeted = self.targeted,
            downloaded = self.downloaded,
            skipped = self.skipped,
            failed = self.failed,
            published = self.published,
            publish_failed = self.publish_failed,
            total = %format_size(self.bytes_downloaded),
            elapsed_secs = self.elapsed.as_secs(),
            throughput_mbps = format!("{:.1}", self.throughput_mbps),
            success_ratio = format!("{:.1}%", self.success_ratio() * 100.0),
            "run complete"
        );
        for session in &self.per_session {
            info!(
                session = %session.name,
                downloads_ok = session.downloads_ok,
                downloads_failed = session.downloads_failed,
                downloads_skipped = session.downloads_skipped,
                publishes_ok = session.publishes_ok,
                publishes_failed = session.publishes_failed,
                bytes = %format_size(session.bytes_downloaded),
                "session summary"
            );
        }
        for (category, count) in &self.errors_by_category {
            warn!(category, count, "errors by category");
        }
    }
}
