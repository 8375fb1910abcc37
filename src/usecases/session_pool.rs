//! Session pool: owns the client sessions, serializes authentication,
//! supervises lifecycle and hands out connected sessions.
//!
//! Starts are concurrent but staggered so the first bursts across sessions
//! do not align; a flood-waited session sleeps and retries once without
//! blocking its siblings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::domain::{AccountInfo, DomainError};
use crate::ports::{ChatGateway, GatewayFactory};

/// Minimum delay between per-session start kickoffs.
pub const START_STAGGER: Duration = Duration::from_secs(5);

/// Bound on the orderly-teardown join per session.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Busy,
    /// Recoverable: flips back to Connected on the next successful operation.
    Error,
    /// Terminal for this process lifetime.
    Disconnected,
}

/// Cumulative per-session counters, exposed in the final report.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub downloads_ok: AtomicU64,
    pub downloads_failed: AtomicU64,
    pub downloads_skipped: AtomicU64,
    pub publishes_ok: AtomicU64,
    pub publishes_failed: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// One pool member: an authenticated gateway plus supervision state.
pub struct PooledSession {
    pub name: String,
    pub gateway: Arc<dyn ChatGateway>,
    state: Mutex<SessionState>,
    account: Mutex<Option<AccountInfo>>,
    /// At most one fetch, download or publish operation runs per session.
    op_lock: tokio::sync::Mutex<()>,
    pub counters: SessionCounters,
}

impl PooledSession {
    fn new(name: String, gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            name,
            gateway,
            state: Mutex::new(SessionState::Idle),
            account: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            counters: SessionCounters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    pub fn account(&self) -> Option<AccountInfo> {
        self.account.lock().expect("session account poisoned").clone()
    }

    pub fn caption_limit(&self) -> usize {
        self.account().map(|a| a.caption_limit()).unwrap_or(1024)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Busy | SessionState::Error
        )
    }

    /// Reserve the session for one operation. Serializes fetch/download/
    /// publish on this session and tracks the busy state.
    pub async fn reserve(&self) -> OperationGuard<'_> {
        let permit = self.op_lock.lock().await;
        self.set_state(SessionState::Busy);
        OperationGuard { session: self, _permit: permit, failed: false }
    }

    pub fn record_download(&self, ok: bool, bytes: u64) {
        if ok {
            self.counters.downloads_ok.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.counters.downloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self) {
        self.counters.downloads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, ok: bool) {
        if ok {
            self.counters.publishes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.publishes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Held for the duration of one session operation; restores the state on
/// drop (Connected, or Error when the operation reported failure).
pub struct OperationGuard<'a> {
    session: &'a PooledSession,
    _permit: tokio::sync::MutexGuard<'a, ()>,
    failed: bool,
}

impl OperationGuard<'_> {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if self.session.state() == SessionState::Busy {
            self.session.set_state(if self.failed {
                SessionState::Error
            } else {
                SessionState::Connected
            });
        }
    }
}

pub struct SessionPool {
    members: Vec<Arc<PooledSession>>,
    stagger: Duration,
}

impl SessionPool {
    /// Load credentials for every name. Names without credentials are
    /// skipped with a warning; an empty result is fatal.
    pub async fn initialize(
        factory: &dyn GatewayFactory,
        session_names: &[String],
    ) -> Result<Self, DomainError> {
        Self::initialize_with_stagger(factory, session_names, START_STAGGER).await
    }

    pub async fn initialize_with_stagger(
        factory: &dyn GatewayFactory,
        session_names: &[String],
        stagger: Duration,
    ) -> Result<Self, DomainError> {
        let mut members = Vec::new();
        for name in session_names {
            match factory.open(name).await {
                Ok(gateway) => {
                    let session = PooledSession::new(name.clone(), gateway);
                    session.set_state(SessionState::Connecting);
                    members.push(Arc::new(session));
                }
                Err(e) => warn!(session = %name, error = %e, "session credentials unavailable"),
            }
        }
        if members.is_empty() {
            return Err(DomainError::Config("no usable session credentials found".into()));
        }
        info!(
            available = members.len(),
            requested = session_names.len(),
            "session pool initialized"
        );
        Ok(Self { members, stagger })
    }

    /// Start every member concurrently with staggered kickoffs. A session
    /// that reports a flood wait sleeps the instructed time and retries once.
    /// The pool continues with the survivors; zero survivors is fatal.
    pub async fn start_all(&self) -> Result<usize, DomainError> {
        let mut tasks = JoinSet::new();
        for (index, session) in self.members.iter().enumerate() {
            let session = Arc::clone(session);
            let delay = self.stagger * index as u32;
            tasks.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Self::start_one(&session).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "session start task panicked");
            }
        }

        let connected = self.sessions().len();
        if connected == 0 {
            return Err(DomainError::Config("no sessions connected".into()));
        }
        info!(connected, total = self.members.len(), "session pool started");
        Ok(connected)
    }

    async fn start_one(session: &PooledSession) {
        session.set_state(SessionState::Connecting);
        let outcome = match session.gateway.connect().await {
            Err(DomainError::FloodWait { seconds }) => {
                warn!(session = %session.name, wait_secs = seconds, "flood wait on connect, retrying once");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                session.gateway.connect().await
            }
            other => other,
        };
        match outcome {
            Ok(account) => {
                info!(
                    session = %session.name,
                    user = %account.display_name,
                    premium = account.is_premium,
                    "session connected"
                );
                *session.account.lock().expect("session account poisoned") = Some(account);
                session.set_state(SessionState::Connected);
            }
            Err(e) => {
                error!(session = %session.name, error = %e, "session failed to connect");
                session.set_state(SessionState::Disconnected);
            }
        }
    }

    /// Request every connected session to stop with a bounded join, then
    /// mark everything disconnected. "Already closed" conditions are logged
    /// and swallowed.
    pub async fn stop_all(&self) {
        let mut tasks = JoinSet::new();
        for session in &self.members {
            if !session.is_connected() {
                continue;
            }
            let session = Arc::clone(session);
            tasks.spawn(async move {
                let stop = tokio::time::timeout(STOP_TIMEOUT, session.gateway.disconnect());
                match stop.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(session = %session.name, error = %e, "stop reported an error (likely already closed)"),
                    Err(_) => warn!(session = %session.name, "stop timed out, forcing close"),
                }
                session.set_state(SessionState::Disconnected);
            });
        }
        while tasks.join_next().await.is_some() {}
        info!("session pool stopped");
    }

    /// Snapshot of the currently-connected sessions, pool order preserved.
    pub fn sessions(&self) -> Vec<Arc<PooledSession>> {
        self.members.iter().filter(|s| s.is_connected()).cloned().collect()
    }

    pub fn session(&self, name: &str) -> Option<Arc<PooledSession>> {
        self.members.iter().find(|s| s.name == name).cloned()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions().iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
