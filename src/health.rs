//! Health checking for live sessions
//!
//! Protocol readiness (`SessionState::Ready`) and transport liveness are
//! checked separately: a session can believe it is ready while its socket has
//! already gone away.

use crate::client::ConnectionState;
use crate::config::LifecyclePolicy;
use crate::events::{now_millis, EventSink};
use crate::registry::SessionRegistry;
use crate::session::{AccountId, Session};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Disconnected,
    Unhealthy,
    NotFound,
    Banned,
}

/// Reason for an unhealthy status
#[derive(Debug, Clone, PartialEq)]
pub enum UnhealthyReason {
    TransportNotOpen(ConnectionState),
    ProbeFailed(String),
    ProbeTimedOut,
    /// The probe task itself died
    CheckAborted,
}

impl std::fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnhealthyReason::TransportNotOpen(state) => write!(f, "transport_{}", state),
            UnhealthyReason::ProbeFailed(msg) => write!(f, "probe_failed:{}", msg),
            UnhealthyReason::ProbeTimedOut => write!(f, "probe_timeout"),
            UnhealthyReason::CheckAborted => write!(f, "check_aborted"),
        }
    }
}

/// number-health outbound payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub account_id: AccountId,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl HealthRecord {
    pub fn new(account_id: AccountId, status: HealthStatus) -> Self {
        Self {
            account_id,
            status,
            reason: None,
            worker_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl ToString) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    fn unhealthy(account_id: AccountId, reason: UnhealthyReason) -> Self {
        Self::new(account_id, HealthStatus::Unhealthy).with_reason(reason)
    }
}

/// Aggregate counts published on the status timer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_id: String,
    pub worker_name: String,
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub disconnected_sessions: usize,
    pub uptime_secs: u64,
    pub timestamp: i64,
}

impl WorkerStatus {
    pub fn collect(
        registry: &SessionRegistry,
        worker_id: &str,
        worker_name: &str,
        started: Instant,
    ) -> Self {
        let sessions = registry.list_active();
        let connected = sessions.iter().filter(|s| s.is_ready()).count();
        Self {
            worker_id: worker_id.to_string(),
            worker_name: worker_name.to_string(),
            total_sessions: sessions.len(),
            connected_sessions: connected,
            disconnected_sessions: sessions.len() - connected,
            uptime_secs: started.elapsed().as_secs(),
            timestamp: now_millis(),
        }
    }
}

/// Check one session without publishing anything
pub async fn assess(session: &Session, query_timeout: Duration) -> HealthRecord {
    let account_id = session.account_id();
    if !session.is_ready() {
        return HealthRecord::new(account_id, HealthStatus::Disconnected)
            .with_reason(session.state());
    }

    match tokio::time::timeout(query_timeout, session.transport_state()).await {
        Ok(Ok(ConnectionState::Open)) => HealthRecord::new(account_id, HealthStatus::Healthy),
        Ok(Ok(state)) => HealthRecord::unhealthy(account_id, UnhealthyReason::TransportNotOpen(state)),
        Ok(Err(e)) => HealthRecord::unhealthy(account_id, UnhealthyReason::ProbeFailed(e.to_string())),
        Err(_) => HealthRecord::unhealthy(account_id, UnhealthyReason::ProbeTimedOut),
    }
}

/// Periodic and on-demand session health checks
#[derive(Clone)]
pub struct HealthMonitor {
    registry: SessionRegistry,
    events: EventSink,
    query_timeout: Duration,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: SessionRegistry, events: EventSink, policy: &LifecyclePolicy) -> Self {
        Self {
            registry,
            events,
            query_timeout: policy.query_timeout,
            interval: policy.health_check_interval,
        }
    }

    async fn emit(&self, record: HealthRecord) -> HealthRecord {
        let record = record.with_worker(self.events.worker_id());
        self.events.health(&record).await;
        record
    }

    /// Check and publish one session
    pub async fn check_session(&self, session: &Session) -> HealthRecord {
        let record = assess(session, self.query_timeout).await;
        debug!(
            account_id = record.account_id,
            status = ?record.status,
            reason = record.reason.as_deref().unwrap_or(""),
            "Health checked"
        );
        self.emit(record).await
    }

    /// Check every registered session
    ///
    /// Each check runs as its own task so a fault in one probe cannot stop
    /// the others.
    pub async fn check_all(&self) -> Vec<HealthRecord> {
        let tasks: Vec<(AccountId, JoinHandle<HealthRecord>)> = self
            .registry
            .list_active()
            .into_iter()
            .map(|session| {
                let query_timeout = self.query_timeout;
                let account_id = session.account_id();
                let task = tokio::spawn(async move { assess(&session, query_timeout).await });
                (account_id, task)
            })
            .collect();

        let mut records = Vec::with_capacity(tasks.len());
        for (account_id, task) in tasks {
            let record = match task.await {
                Ok(record) => record,
                Err(e) => {
                    warn!(account_id, error = %e, "Health probe task failed");
                    HealthRecord::unhealthy(account_id, UnhealthyReason::CheckAborted)
                }
            };
            records.push(self.emit(record).await);
        }

        info!(
            checked = records.len(),
            healthy = records
                .iter()
                .filter(|r| r.status == HealthStatus::Healthy)
                .count(),
            "Health check cycle complete"
        );
        records
    }

    /// On-demand probe for one account
    pub async fn probe(&self, account_id: AccountId) -> HealthRecord {
        match self.registry.find(account_id) {
            Some(session) => self.check_session(&session).await,
            None => {
                self.emit(HealthRecord::new(account_id, HealthStatus::NotFound))
                    .await
            }
        }
    }

    /// Publish a ban notice for an account
    pub async fn report_banned(&self, account_id: AccountId, reason: &str) -> HealthRecord {
        warn!(account_id, reason, "Account flagged as banned");
        self.emit(HealthRecord::new(account_id, HealthStatus::Banned).with_reason(reason))
            .await
    }

    /// Run `check_all` on the configured interval until shutdown flips
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup restores settle
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Health monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
