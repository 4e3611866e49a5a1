//! Session lifecycle controller
//!
//! Owns creation, teardown and recovery of sessions. Every transition for an
//! account runs under that account's registry lock, and client events for a
//! session are consumed by one task per session, so transitions for one
//! account never interleave.

use crate::classify;
use crate::client::{ClientConnector, ClientEvent, ConnectRequest, DisconnectReason, InboundMessage};
use crate::config::LifecyclePolicy;
use crate::error::{Error, Result};
use crate::events::{EventSink, InboundMessageEvent, WorkerAction, WorkerEvent};
use crate::health::{HealthRecord, HealthStatus};
use crate::registry::{AccountGuard, SessionRegistry};
use crate::session::{AccountId, RetryCounters, Session, SessionSnapshot};
use crate::store::{CredentialStore, StoredCredentials};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How to treat the client handle when a session is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Revoke credentials with the service
    Logout,
    /// Close the connection, credentials stay valid
    Release,
}

struct Inner {
    registry: SessionRegistry,
    connector: Arc<dyn ClientConnector>,
    store: Arc<dyn CredentialStore>,
    events: EventSink,
    policy: LifecyclePolicy,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// Creates, recovers and destroys sessions
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(
        registry: SessionRegistry,
        connector: Arc<dyn ClientConnector>,
        store: Arc<dyn CredentialStore>,
        events: EventSink,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                connector,
                store,
                events,
                policy,
                loops: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.inner.policy
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a session for an account
    ///
    /// An account that already has a session keeps it; its snapshot is
    /// returned unchanged.
    pub async fn create(&self, account_id: AccountId, phone_number: &str) -> Result<SessionSnapshot> {
        let _guard = self.inner.registry.lock_account(account_id).await;

        if let Some(existing) = self.inner.registry.find(account_id) {
            info!(account_id, session_id = existing.id(), "Session already exists");
            return Ok(existing.snapshot());
        }

        match self
            .spawn_session(account_id, phone_number, RetryCounters::default(), None)
            .await
        {
            Ok(session) => {
                info!(account_id, session_id = session.id(), "Session created");
                Ok(session.snapshot())
            }
            Err(Error::ShuttingDown) => Err(Error::ShuttingDown),
            Err(e) => {
                error!(account_id, error = %e, "Failed to create session");
                let session_id = Session::session_id_for(account_id, phone_number);
                self.emit(
                    WorkerEvent::new(WorkerAction::Error, account_id, &session_id)
                        .error(e.to_string())
                        .message("Failed to create session"),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Log out and destroy an account's session, purging its credentials
    ///
    /// Returns `false` when there was nothing to close.
    pub async fn close(&self, account_id: AccountId) -> Result<bool> {
        let _guard = self.inner.registry.lock_account(account_id).await;

        let Some(session) = self.inner.registry.find(account_id) else {
            debug!(account_id, "No session to close");
            return Ok(false);
        };

        self.destroy(&session, Teardown::Logout).await;
        self.delete_credentials(account_id).await;
        info!(account_id, session_id = session.id(), "Session closed");
        self.emit(
            WorkerEvent::new(WorkerAction::Disconnected, account_id, session.id()).reason("closed"),
        )
        .await;
        Ok(true)
    }

    /// Replace an account's session with a fresh connection
    ///
    /// Credentials are kept. Without a phone number the existing session's
    /// number is reused.
    pub async fn reconnect(
        &self,
        account_id: AccountId,
        phone_number: Option<&str>,
    ) -> Result<SessionSnapshot> {
        let _guard = self.inner.registry.lock_account(account_id).await;
        let existing = self.inner.registry.find(account_id);
        let phone_number = resolve_phone(account_id, phone_number, existing.as_deref())?;

        info!(account_id, "Reconnecting session on request");
        let session = self.restart(account_id, &phone_number, existing).await?;
        Ok(session.snapshot())
    }

    /// Issue a new authentication challenge for an account that is not ready
    pub async fn regenerate_qr(
        &self,
        account_id: AccountId,
        phone_number: Option<&str>,
    ) -> Result<SessionSnapshot> {
        let _guard = self.inner.registry.lock_account(account_id).await;
        let existing = self.inner.registry.find(account_id);

        if let Some(session) = existing.as_ref().filter(|s| s.is_ready()) {
            info!(account_id, "Session already connected, not regenerating QR");
            self.emit(
                WorkerEvent::new(WorkerAction::Connected, account_id, session.id())
                    .message("already connected"),
            )
            .await;
            return Ok(session.snapshot());
        }

        let phone_number = resolve_phone(account_id, phone_number, existing.as_deref())?;
        info!(account_id, "Regenerating QR");
        let session = self.restart(account_id, &phone_number, existing).await?;
        Ok(session.snapshot())
    }

    /// Create a session for every account with stored credentials
    ///
    /// Returns how many sessions were started.
    pub async fn restore_all(&self) -> usize {
        let stored = match self.inner.store.list().await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to list stored credentials");
                return 0;
            }
        };

        let mut restored = 0;
        for creds in stored {
            match self.create(creds.account_id, &creds.phone_number).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(account_id = creds.account_id, error = %e, "Failed to restore session"),
            }
        }
        info!(restored, "Restored sessions from storage");
        restored
    }

    /// Release every session without logging out, then stop event loops
    ///
    /// No session can be registered once this starts, so the drain ends.
    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);

        loop {
            let accounts: BTreeSet<AccountId> = self
                .inner
                .registry
                .list_active()
                .iter()
                .map(|s| s.account_id())
                .collect();
            if accounts.is_empty() {
                break;
            }

            for account_id in accounts {
                let _guard = self.inner.registry.lock_account(account_id).await;
                // Whatever is registered now, which may be a replacement made
                // while we waited for the lock
                let Some(session) = self.inner.registry.find(account_id) else {
                    continue;
                };
                self.destroy(&session, Teardown::Release).await;
                self.emit(
                    WorkerEvent::new(WorkerAction::Disconnected, account_id, session.id())
                        .reason("shutdown"),
                )
                .await;
            }
        }

        let loops: Vec<_> = self
            .inner
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in loops {
            task.abort();
        }
        info!("Lifecycle controller stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    // ========================================================================
    // Session construction and teardown
    // ========================================================================

    /// Drop the current connection (if any) and register a fresh session
    ///
    /// Caller holds the account lock.
    async fn restart(
        &self,
        account_id: AccountId,
        phone_number: &str,
        existing: Option<Arc<Session>>,
    ) -> Result<Arc<Session>> {
        let Some(existing) = existing else {
            return self
                .spawn_session(account_id, phone_number, RetryCounters::default(), None)
                .await;
        };

        existing.mark_reconnecting();
        release_handle(&existing).await;

        match self
            .spawn_session(account_id, phone_number, RetryCounters::default(), Some(&existing))
            .await
        {
            Ok(session) => Ok(session),
            Err(Error::ShuttingDown) => Err(Error::ShuttingDown),
            Err(e) => {
                error!(account_id, error = %e, "Failed to restart session");
                self.destroy(&existing, Teardown::Release).await;
                self.emit(
                    WorkerEvent::new(WorkerAction::Error, account_id, existing.id())
                        .error(e.to_string())
                        .message("Failed to restart session"),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Connect a new session and register it
    ///
    /// With a predecessor, the new session replaces it only once connected,
    /// so the account never has two registered sessions. Caller holds the
    /// account lock.
    async fn spawn_session(
        &self,
        account_id: AccountId,
        phone_number: &str,
        counters: RetryCounters,
        predecessor: Option<&Arc<Session>>,
    ) -> Result<Arc<Session>> {
        self.ensure_running()?;
        let credentials = match self.inner.store.load(account_id).await {
            Ok(stored) => stored.map(|c| c.data),
            Err(e) => {
                warn!(account_id, error = %e, "Failed to load credentials, starting fresh");
                None
            }
        };

        let session = Arc::new(Session::new(account_id, phone_number, counters));
        let request = ConnectRequest {
            session_id: session.id().to_string(),
            account_id,
            phone_number: phone_number.to_string(),
            credentials,
        };

        let timeout = self.inner.policy.connect_timeout;
        let connection = match tokio::time::timeout(timeout, self.inner.connector.connect(request)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "connect",
                    after: timeout,
                })
            }
        };
        session.install_handle(connection.handle).await;

        let registered = self.ensure_running().and_then(|_| match predecessor {
            Some(previous) => {
                if self.inner.registry.replace(previous, session.clone()) {
                    previous.mark_closed();
                    Ok(())
                } else {
                    Err(Error::AlreadyExists(account_id))
                }
            }
            None => self.inner.registry.upsert(session.clone(), false).map(|_| ()),
        });
        if let Err(e) = registered {
            session.mark_closed();
            release_handle(&session).await;
            return Err(e);
        }

        debug!(
            account_id,
            session_id = session.id(),
            qr_retries = counters.qr_retries,
            reconnect_attempts = counters.reconnect_attempts,
            "Session connected to client"
        );
        self.spawn_event_loop(session.clone(), connection.events);
        Ok(session)
    }

    /// Remove from the registry first, then close the handle
    async fn destroy(&self, session: &Arc<Session>, teardown: Teardown) {
        self.inner.registry.remove(session.id());
        session.mark_closed();

        let Some(handle) = session.take_handle().await else {
            return;
        };
        let result = match teardown {
            Teardown::Logout => handle.logout().await,
            Teardown::Release => handle.disconnect().await,
        };
        if let Err(e) = result {
            if !classify::is_intentional_logout(&e) {
                warn!(session_id = session.id(), error = %e, "Error closing client");
            }
        }
    }

    async fn delete_credentials(&self, account_id: AccountId) {
        if let Err(e) = self.inner.store.delete(account_id).await {
            warn!(account_id, error = %e, "Failed to delete credentials");
        }
    }

    // ========================================================================
    // Client events
    // ========================================================================

    fn spawn_event_loop(&self, session: Arc<Session>, events: mpsc::Receiver<ClientEvent>) {
        let controller = self.clone();
        let task = tokio::spawn(controller.run_events(session, events));

        let mut loops = self.inner.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.retain(|t| !t.is_finished());
        loops.push(task);
    }

    async fn run_events(self, session: Arc<Session>, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(&session, event).await {
                break;
            }
        }
        debug!(session_id = session.id(), "Client event loop finished");
    }

    /// Apply one client event; returns whether to keep listening
    async fn handle_event(&self, session: &Arc<Session>, event: ClientEvent) -> bool {
        match event {
            // Inbound traffic does not wait behind sends or transitions
            ClientEvent::Message(message) => {
                if !self.inner.registry.is_current(session) {
                    debug!(session_id = session.id(), "Ignoring message for stale session");
                    return false;
                }
                self.forward_inbound(session, message).await;
                true
            }
            event => {
                let guard = self.inner.registry.lock_account(session.account_id()).await;
                if !self.inner.registry.is_current(session) {
                    debug!(session_id = session.id(), "Ignoring event for stale session");
                    return false;
                }
                self.apply_transition(session, event, guard).await
            }
        }
    }

    /// Caller holds the account lock and has checked the session is current
    async fn apply_transition(
        &self,
        session: &Arc<Session>,
        event: ClientEvent,
        guard: AccountGuard,
    ) -> bool {
        let account_id = session.account_id();
        match event {
            ClientEvent::Qr(code) => {
                if session.mark_awaiting_auth(code.clone()) {
                    let attempt = session.counters().qr_retries + 1;
                    info!(account_id, attempt, "QR code generated");
                    self.emit(
                        WorkerEvent::new(WorkerAction::QrGenerated, account_id, session.id())
                            .qr_code(code)
                            .attempt(attempt),
                    )
                    .await;
                }
                true
            }
            ClientEvent::Open => {
                if session.mark_ready() {
                    info!(account_id, session_id = session.id(), "Session connected");
                    self.emit_health(account_id, HealthStatus::Healthy, None).await;
                    self.emit(
                        WorkerEvent::new(WorkerAction::Connected, account_id, session.id())
                            .message("connected"),
                    )
                    .await;
                }
                true
            }
            ClientEvent::CredentialsUpdated(data) => {
                let creds = StoredCredentials {
                    account_id,
                    phone_number: session.phone_number().to_string(),
                    data,
                    updated_at: Utc::now(),
                };
                if let Err(e) = self.inner.store.save(&creds).await {
                    warn!(account_id, error = %e, "Failed to save credentials");
                }
                true
            }
            ClientEvent::Message(message) => {
                drop(guard);
                self.forward_inbound(session, message).await;
                true
            }
            ClientEvent::Closed(reason) => {
                self.on_closed(session, reason, guard).await;
                false
            }
        }
    }

    async fn forward_inbound(&self, session: &Session, message: InboundMessage) {
        debug!(account_id = session.account_id(), from = %message.from, "Inbound message");
        let event = InboundMessageEvent {
            session_id: session.id().to_string(),
            account_id: session.account_id(),
            message_id: message.id,
            from: message.from,
            body: message.body,
            timestamp: message.timestamp,
            has_media: message.has_media,
            kind: message.kind,
        };
        self.inner.events.inbound_message(&event).await;
    }

    async fn on_closed(&self, session: &Arc<Session>, reason: DisconnectReason, guard: AccountGuard) {
        let account_id = session.account_id();
        info!(account_id, session_id = session.id(), %reason, "Client connection closed");

        match reason {
            DisconnectReason::LoggedOut => {
                self.destroy(session, Teardown::Release).await;
                self.delete_credentials(account_id).await;
                self.emit_health(account_id, HealthStatus::Banned, Some("logged_out"))
                    .await;
                self.emit(
                    WorkerEvent::new(WorkerAction::Disconnected, account_id, session.id())
                        .reason("logged_out")
                        .error(Error::LoggedOut(account_id).to_string()),
                )
                .await;
            }
            DisconnectReason::ChallengeExpired => {
                self.on_challenge_expired(session).await;
            }
            DisconnectReason::Conflict => {
                self.delete_credentials(account_id).await;
                self.emit(
                    WorkerEvent::new(WorkerAction::SessionConflict, account_id, session.id())
                        .reason("conflict")
                        .message("Session replaced by another client"),
                )
                .await;
                self.recover(session.clone(), guard).await;
            }
            DisconnectReason::StreamError(_) | DisconnectReason::ConnectionLost(_) => {
                self.recover(session.clone(), guard).await;
            }
            DisconnectReason::Fatal(message) => {
                self.destroy(session, Teardown::Release).await;
                let err = Error::UnrecoverableClientFault(message);
                self.emit(
                    WorkerEvent::new(WorkerAction::Error, account_id, session.id())
                        .error(err.to_string())
                        .reason(err.code()),
                )
                .await;
            }
        }
    }

    /// Bounded automatic recreation after an unconfirmed challenge
    async fn on_challenge_expired(&self, session: &Arc<Session>) {
        let account_id = session.account_id();
        let counters = session.counters();
        let max = self.inner.policy.max_qr_retries;

        if counters.qr_retries >= max {
            warn!(account_id, attempts = counters.qr_retries, "QR retries exhausted");
            self.destroy(session, Teardown::Release).await;
            let err = Error::AuthChallengeExpired {
                attempts: counters.qr_retries,
            };
            self.emit(
                WorkerEvent::new(WorkerAction::Error, account_id, session.id())
                    .error(err.to_string())
                    .reason(err.code()),
            )
            .await;
            return;
        }

        let next = RetryCounters {
            qr_retries: counters.qr_retries + 1,
            ..counters
        };
        info!(account_id, attempt = next.qr_retries, max, "QR expired, regenerating");
        self.emit(
            WorkerEvent::new(WorkerAction::QrRegenerating, account_id, session.id())
                .attempt(next.qr_retries),
        )
        .await;

        release_handle(session).await;
        match self
            .spawn_session(account_id, session.phone_number(), next, Some(session))
            .await
        {
            Ok(_) | Err(Error::ShuttingDown) => {}
            Err(e) => {
                error!(account_id, error = %e, "Failed to regenerate QR");
                self.destroy(session, Teardown::Release).await;
                self.emit(
                    WorkerEvent::new(WorkerAction::Error, account_id, session.id())
                        .error(e.to_string())
                        .message("Failed to regenerate QR"),
                )
                .await;
            }
        }
    }

    /// Reconnect with exponential backoff until connected, superseded or
    /// failed permanently
    async fn recover(&self, session: Arc<Session>, guard: AccountGuard) {
        let account_id = session.account_id();
        session.mark_reconnecting();
        release_handle(&session).await;
        let mut counters = session.counters();
        drop(guard);

        loop {
            let delay = self.inner.policy.reconnect_delay(counters.reconnect_attempts);
            info!(
                account_id,
                attempt = counters.reconnect_attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            let _guard = self.inner.registry.lock_account(account_id).await;
            if !self.inner.registry.is_current(&session) {
                debug!(account_id, "Reconnect superseded");
                return;
            }

            counters.reconnect_attempts += 1;
            match self
                .spawn_session(account_id, session.phone_number(), counters, Some(&session))
                .await
            {
                Ok(next) => {
                    info!(account_id, session_id = next.id(), "Session reconnected");
                    return;
                }
                Err(Error::ShuttingDown) => {
                    debug!(account_id, "Reconnect abandoned for shutdown");
                    return;
                }
                Err(e) if e.is_temporary() => {
                    warn!(account_id, error = %e, "Reconnect attempt failed");
                }
                Err(e) => {
                    error!(account_id, error = %e, "Reconnect failed permanently");
                    self.destroy(&session, Teardown::Release).await;
                    self.emit(
                        WorkerEvent::new(WorkerAction::Error, account_id, session.id())
                            .error(e.to_string())
                            .message("Reconnect failed"),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    async fn emit(&self, event: WorkerEvent) {
        self.inner.events.worker_event(&event).await;
    }

    async fn emit_health(&self, account_id: AccountId, status: HealthStatus, reason: Option<&str>) {
        let mut record = HealthRecord::new(account_id, status).with_worker(self.inner.events.worker_id());
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        self.inner.events.health(&record).await;
    }
}

/// Close a session's client without logging out; the session keeps its slot
async fn release_handle(session: &Session) {
    if let Some(handle) = session.take_handle().await {
        if let Err(e) = handle.disconnect().await {
            debug!(session_id = session.id(), error = %e, "Error releasing client");
        }
    }
}

fn resolve_phone(
    account_id: AccountId,
    requested: Option<&str>,
    existing: Option<&Session>,
) -> Result<String> {
    requested
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .or_else(|| existing.map(|s| s.phone_number().to_string()))
        .ok_or_else(|| {
            Error::InvalidPayload(format!("phoneNumber is required for account {}", account_id))
        })
}
