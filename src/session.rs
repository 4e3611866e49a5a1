//! Per-account session object
//!
//! A `Session` is one account's connection to the chat service. Its client
//! handle is owned exclusively by the session and is taken out (leaving
//! `None`) when the session is destroyed, so nothing can reach the client
//! through a stale session afterwards.

use crate::client::{ChatHandle, ConnectionState, MessageRef, OutboundContent};
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::RwLock;

/// Stable business key for an account
pub type AccountId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    AwaitingAuth,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::AwaitingAuth => "awaiting_auth",
            SessionState::Ready => "ready",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Counters carried from one session object to its replacement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    /// Authentication challenges that expired unconfirmed
    pub qr_retries: u32,
    /// Consecutive transient reconnects without reaching `Ready`
    pub reconnect_attempts: u32,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    last_qr: Option<String>,
    counters: RetryCounters,
}

/// Point-in-time copy of a session's observable fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub account_id: AccountId,
    pub phone_number: String,
    pub state: SessionState,
    pub has_qr: bool,
    pub qr_retries: u32,
}

pub struct Session {
    id: String,
    account_id: AccountId,
    phone_number: String,
    status: Mutex<Status>,
    handle: RwLock<Option<Box<dyn ChatHandle>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(account_id: AccountId, phone_number: &str, counters: RetryCounters) -> Self {
        Self {
            id: Self::session_id_for(account_id, phone_number),
            account_id,
            phone_number: phone_number.to_string(),
            status: Mutex::new(Status {
                state: SessionState::Initializing,
                last_qr: None,
                counters,
            }),
            handle: RwLock::new(None),
        }
    }

    /// Deterministic session id from account id and phone digits
    pub fn session_id_for(account_id: AccountId, phone_number: &str) -> String {
        let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
        format!("session_{}_{}", account_id, digits)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn phone_number(&self) -> &str {
        &self.phone_number
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn counters(&self) -> RetryCounters {
        self.status().counters
    }

    pub fn last_qr(&self) -> Option<String> {
        self.status().last_qr.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            session_id: self.id.clone(),
            account_id: self.account_id,
            phone_number: self.phone_number.clone(),
            state: status.state,
            has_qr: status.last_qr.is_some(),
            qr_retries: status.counters.qr_retries,
        }
    }

    /// Record a new challenge token; ignored once closed
    pub fn mark_awaiting_auth(&self, qr: String) -> bool {
        let mut status = self.status();
        if status.state == SessionState::Closed {
            return false;
        }
        status.state = SessionState::AwaitingAuth;
        status.last_qr = Some(qr);
        true
    }

    /// Enter `Ready`, clearing the challenge and resetting retry counters
    pub fn mark_ready(&self) -> bool {
        let mut status = self.status();
        if status.state == SessionState::Closed {
            return false;
        }
        status.state = SessionState::Ready;
        status.last_qr = None;
        status.counters = RetryCounters::default();
        true
    }

    pub fn mark_reconnecting(&self) -> bool {
        let mut status = self.status();
        if status.state == SessionState::Closed {
            return false;
        }
        status.state = SessionState::Reconnecting;
        status.last_qr = None;
        true
    }

    /// Returns the previous state
    pub fn mark_closed(&self) -> SessionState {
        let mut status = self.status();
        let previous = status.state;
        status.state = SessionState::Closed;
        status.last_qr = None;
        previous
    }

    pub async fn install_handle(&self, handle: Box<dyn ChatHandle>) {
        *self.handle.write().await = Some(handle);
    }

    /// Remove the client handle; later calls through this session see no client
    pub async fn take_handle(&self) -> Option<Box<dyn ChatHandle>> {
        self.handle.write().await.take()
    }

    pub async fn has_handle(&self) -> bool {
        self.handle.read().await.is_some()
    }

    /// Send through the owned handle
    pub async fn send(&self, recipient: &str, content: &OutboundContent) -> Result<MessageRef> {
        let guard = self.handle.read().await;
        let handle = guard
            .as_ref()
            .ok_or(Error::SessionNotConnected(self.account_id))?;
        Ok(handle.send_content(recipient, content).await?)
    }

    /// Transport liveness; a released handle reads as closed
    pub async fn transport_state(&self) -> Result<ConnectionState> {
        let guard = self.handle.read().await;
        match guard.as_ref() {
            Some(handle) => Ok(handle.connection_state().await?),
            None => Ok(ConnectionState::Closed),
        }
    }
}
