// ABOUTME: Session manager - the single registry of live client sessions
// ABOUTME: Enforces the session limit, one execution per session, and idle/lifetime eviction

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::supervisor::ProcessControl;

/// Opaque session identifier, unique for the lifetime of the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Busy,
    Closing,
    Closed,
}

/// Proof that the holder started the session's current execution.
///
/// Ending or attaching with a stale token is a no-op, so a late cleanup from
/// an old execution cannot release a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken(u64);

/// Limits applied by the manager.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    /// Absolute age limit; `None` means unlimited.
    pub max_lifetime: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout: Duration::from_secs(3600),
            max_lifetime: None,
        }
    }
}

/// Read-only view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub request_id: Option<String>,
    pub pid: Option<u32>,
    pub executions: u64,
}

/// Aggregate counts for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub busy_sessions: usize,
    pub max_sessions: usize,
}

struct Execution {
    lease: LeaseToken,
    request_id: String,
    control: Option<ProcessControl>,
    cancel_requested: bool,
}

struct Session {
    id: SessionId,
    state: SessionState,
    created: Instant,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    execution: Option<Execution>,
    executions: u64,
}

impl Session {
    fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            age_secs: now.saturating_duration_since(self.created).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            request_id: self.execution.as_ref().map(|e| e.request_id.clone()),
            pid: self
                .execution
                .as_ref()
                .and_then(|e| e.control.as_ref())
                .map(ProcessControl::pid),
            executions: self.executions,
        }
    }

    /// Ask the running process, if any, to terminate.
    fn cancel_process(&mut self) -> bool {
        match self.execution.as_mut() {
            Some(exec) => {
                exec.cancel_requested = true;
                exec.control.as_ref().map(ProcessControl::cancel).unwrap_or(false)
            }
            None => false,
        }
    }
}

/// Registry of live sessions behind a single lock.
pub struct SessionManager {
    limits: SessionLimits,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_lease: AtomicU64,
}

impl SessionManager {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Allocate a new session, or fail with `ResourceExhausted` when full.
    pub async fn create_session(&self) -> Result<SessionId, ExecError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.limits.max_sessions {
            tracing::warn!(
                active = sessions.len(),
                max = self.limits.max_sessions,
                "Session limit reached, rejecting connection"
            );
            return Err(ExecError::ResourceExhausted {
                active: sessions.len(),
                max: self.limits.max_sessions,
            });
        }

        let id = SessionId::generate();
        let now = Instant::now();
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                state: SessionState::Connected,
                created: now,
                created_at: Utc::now(),
                last_activity: now,
                execution: None,
                executions: 0,
            },
        );
        tracing::info!(session_id = %id, active = sessions.len(), "Session created");
        Ok(id)
    }

    /// Record activity on a session.
    pub async fn touch(&self, id: &SessionId) -> Result<(), ExecError> {
        let mut sessions = self.sessions.lock().await;
        let session = lookup(&mut sessions, id)?;
        session.last_activity = Instant::now();
        Ok(())
    }

    /// Mark the session Busy for `request_id` and hand out the lease.
    pub async fn begin_execution(
        &self,
        id: &SessionId,
        request_id: &str,
    ) -> Result<LeaseToken, ExecError> {
        let mut sessions = self.sessions.lock().await;
        let session = lookup(&mut sessions, id)?;

        match session.state {
            SessionState::Connected => {}
            SessionState::Busy => return Err(ExecError::SessionBusy(id.to_string())),
            SessionState::Closing | SessionState::Closed => {
                return Err(ExecError::NotFound(format!("session {id} is closing")))
            }
        }

        let lease = LeaseToken(self.next_lease.fetch_add(1, Ordering::Relaxed));
        session.state = SessionState::Busy;
        session.last_activity = Instant::now();
        session.executions += 1;
        session.execution = Some(Execution {
            lease,
            request_id: request_id.to_string(),
            control: None,
            cancel_requested: false,
        });
        tracing::debug!(session_id = %id, request_id, "Execution started");
        Ok(lease)
    }

    /// Register the spawned process with the session's execution.
    ///
    /// Fails when the session went away or a cancel arrived while the process
    /// was starting; the caller then owns cancelling `control`.
    pub async fn attach_process(
        &self,
        id: &SessionId,
        lease: LeaseToken,
        control: ProcessControl,
    ) -> Result<(), ExecError> {
        let mut sessions = self.sessions.lock().await;
        let session = lookup(&mut sessions, id)?;
        match session.execution.as_mut() {
            Some(exec) if exec.lease == lease => {
                if exec.cancel_requested {
                    return Err(ExecError::Cancelled);
                }
                exec.control = Some(control);
                Ok(())
            }
            _ => Err(ExecError::NotFound(format!(
                "execution lease for session {id} no longer held"
            ))),
        }
    }

    /// True if a cancel was requested for the execution behind `lease`.
    /// A missing session or stale lease counts as cancelled.
    pub async fn is_cancel_requested(&self, id: &SessionId, lease: LeaseToken) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(id).and_then(|s| s.execution.as_ref()) {
            Some(exec) if exec.lease == lease => exec.cancel_requested,
            _ => true,
        }
    }

    /// Return the session to Connected. Idempotent; returns whether anything changed.
    pub async fn end_execution(&self, id: &SessionId, lease: LeaseToken) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match &session.execution {
            Some(exec) if exec.lease == lease => {
                session.execution = None;
                session.last_activity = Instant::now();
                if session.state == SessionState::Busy {
                    session.state = SessionState::Connected;
                }
                tracing::debug!(session_id = %id, "Execution ended");
                true
            }
            _ => false,
        }
    }

    /// Cancel the session's current execution.
    ///
    /// Returns the request id being cancelled. A repeated cancel of the same
    /// execution succeeds again; no execution at all is `NotFound`.
    pub async fn cancel_execution(&self, id: &SessionId) -> Result<String, ExecError> {
        let mut sessions = self.sessions.lock().await;
        let session = lookup(&mut sessions, id)?;
        session.last_activity = Instant::now();

        let request_id = session
            .execution
            .as_ref()
            .map(|e| e.request_id.clone())
            .ok_or_else(|| ExecError::NotFound(format!("no active execution in session {id}")))?;
        session.cancel_process();
        tracing::info!(session_id = %id, request_id = %request_id, "Cancel requested");
        Ok(request_id)
    }

    /// Request id and control handle of the running process, for pause/resume.
    pub async fn active_process(
        &self,
        id: &SessionId,
    ) -> Result<(String, ProcessControl), ExecError> {
        let mut sessions = self.sessions.lock().await;
        let session = lookup(&mut sessions, id)?;
        session.last_activity = Instant::now();
        session
            .execution
            .as_ref()
            .and_then(|e| e.control.clone().map(|c| (e.request_id.clone(), c)))
            .ok_or_else(|| ExecError::NotFound(format!("no running process in session {id}")))
    }

    /// Terminate any running process and release the slot.
    pub async fn close_session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        session.state = SessionState::Closing;
        let cancelled = session.cancel_process();

        let mut removed = sessions.remove(id)?;
        removed.state = SessionState::Closed;
        tracing::info!(
            session_id = %id,
            cancelled_process = cancelled,
            active = sessions.len(),
            "Session closed"
        );
        Some(removed.snapshot(Instant::now()))
    }

    /// Evict sessions idle past the idle timeout or older than the lifetime limit.
    ///
    /// Processes are asked to terminate before their session is removed.
    pub async fn evict_expired(&self, now: Instant) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| self.is_expired(s, now))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(mut session) = sessions.remove(id) {
                session.state = SessionState::Closing;
                let cancelled = session.cancel_process();
                tracing::info!(
                    session_id = %id,
                    idle_secs = now.saturating_duration_since(session.last_activity).as_secs(),
                    cancelled_process = cancelled,
                    "Session evicted"
                );
            }
        }
        expired
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        let idle = now.saturating_duration_since(session.last_activity);
        let age = now.saturating_duration_since(session.created);
        idle > self.limits.idle_timeout || self.limits.max_lifetime.is_some_and(|max| age > max)
    }

    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, ExecError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(id)
            .map(|s| s.snapshot(Instant::now()))
            .ok_or_else(|| ExecError::NotFound(format!("session {id}")))
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.lock().await;
        SessionStats {
            active_sessions: sessions.len(),
            busy_sessions: sessions
                .values()
                .filter(|s| s.state == SessionState::Busy)
                .count(),
            max_sessions: self.limits.max_sessions,
        }
    }

    /// Close every session, cancelling their processes. Used on shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (id, mut session) in sessions.drain() {
            if session.cancel_process() {
                tracing::info!(session_id = %id, "Cancelled process during shutdown");
            }
        }
        count
    }

    /// Run `evict_expired` every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = manager.evict_expired(Instant::now()).await;
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "Sweeper evicted sessions");
                        }
                    }
                }
            }
            tracing::debug!("Session sweeper stopped");
        })
    }
}

fn lookup<'a>(
    sessions: &'a mut HashMap<SessionId, Session>,
    id: &SessionId,
) -> Result<&'a mut Session, ExecError> {
    sessions
        .get_mut(id)
        .ok_or_else(|| ExecError::NotFound(format!("session {id}")))
}
