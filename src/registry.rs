//! Session registry - the single source of truth for live sessions
//!
//! Keyed by account id. Cheap to clone; every clone shares the same map.
//! Also hands out per-account async locks so that lifecycle transitions and
//! sends for one account never interleave.

use crate::error::{Error, Result};
use crate::session::{AccountId, Session};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<AccountId, Arc<Session>>>,
    locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Concurrency-safe map from account id to its live session
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AccountId, Arc<Session>>> {
        self.inner.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<AccountId, Arc<Session>>> {
        self.inner.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialize work for one account; held across awaits
    pub async fn lock_account(&self, account_id: AccountId) -> AccountGuard {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(account_id).or_default().clone()
        };
        AccountGuard {
            account_id,
            inner: self.inner.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Insert a session, failing if the account already has one unless `replace`
    ///
    /// Returns the displaced session when replacing.
    pub fn upsert(&self, session: Arc<Session>, replace: bool) -> Result<Option<Arc<Session>>> {
        let mut sessions = self.write();
        let account_id = session.account_id();
        if sessions.contains_key(&account_id) && !replace {
            return Err(Error::AlreadyExists(account_id));
        }
        Ok(sessions.insert(account_id, session))
    }

    /// Swap `current` for `next` only if `current` is still the registered session
    pub fn replace(&self, current: &Arc<Session>, next: Arc<Session>) -> bool {
        let mut sessions = self.write();
        match sessions.get(&current.account_id()) {
            Some(existing) if Arc::ptr_eq(existing, current) => {
                sessions.insert(next.account_id(), next);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, account_id: AccountId) -> Result<Arc<Session>> {
        self.find(account_id)
            .ok_or(Error::NoActiveSession(account_id))
    }

    pub fn find(&self, account_id: AccountId) -> Option<Arc<Session>> {
        self.read().get(&account_id).cloned()
    }

    /// Whether `session` is the object currently registered for its account
    pub fn is_current(&self, session: &Arc<Session>) -> bool {
        self.read()
            .get(&session.account_id())
            .is_some_and(|existing| Arc::ptr_eq(existing, session))
    }

    /// Remove by session id; absent ids are a no-op
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.write();
        let account_id = sessions
            .iter()
            .find(|(_, s)| s.id() == session_id)
            .map(|(id, _)| *id)?;
        sessions.remove(&account_id)
    }

    /// Snapshot of every registered session
    pub fn list_active(&self) -> Vec<Arc<Session>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Exclusive access to one account, released on drop
///
/// The account's lock entry is pruned once nobody holds or waits on it.
pub struct AccountGuard {
    account_id: AccountId,
    inner: Arc<Inner>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AccountGuard {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map still references the mutex: no holder, no waiters
        if locks
            .get(&self.account_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.account_id);
        }
    }
}
