//! Credential persistence
//!
//! One directory per account under the session dir, holding an atomically
//! replaced `creds.json`. The lifecycle controller only sees the
//! [`CredentialStore`] trait; the layout is private to this module.

use crate::error::{Error, Result};
use crate::session::AccountId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{info, warn};

const CREDS_FILE: &str = "creds.json";
const ACCOUNT_DIR_PREFIX: &str = "account_";

/// Credential material for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    pub account_id: AccountId,
    pub phone_number: String,
    /// Opaque client-library state
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, account_id: AccountId) -> Result<Option<StoredCredentials>>;
    async fn save(&self, credentials: &StoredCredentials) -> Result<()>;
    /// Idempotent; deleting absent credentials is not an error
    async fn delete(&self, account_id: AccountId) -> Result<()>;
    async fn list(&self) -> Result<Vec<StoredCredentials>>;
}

/// Disk usage of one account's credential directory
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUsage {
    pub account_id: AccountId,
    pub bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub session_dir: PathBuf,
    pub total_accounts: usize,
    pub total_bytes: u64,
    pub accounts: Vec<AccountUsage>,
}

/// File-backed credential store
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn account_dir(&self, account_id: AccountId) -> PathBuf {
        self.dir.join(format!("{}{}", ACCOUNT_DIR_PREFIX, account_id))
    }

    fn creds_path(&self, account_id: AccountId) -> PathBuf {
        self.account_dir(account_id).join(CREDS_FILE)
    }

    /// Account ids that have a directory on disk
    pub fn account_ids(&self) -> Result<Vec<AccountId>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<AccountId> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(ACCOUNT_DIR_PREFIX))
                    .and_then(|id| id.parse().ok())
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn read_sync(&self, account_id: AccountId) -> Result<Option<StoredCredentials>> {
        let path = self.creds_path(account_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_sync(&self, credentials: &StoredCredentials) -> Result<()> {
        let dir = self.account_dir(credentials.account_id);
        fs::create_dir_all(&dir)?;

        // Write to temp file in same directory (for atomic rename)
        let mut temp = NamedTempFile::new_in(&dir)?;
        let json = serde_json::to_string_pretty(credentials)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(dir.join(CREDS_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn delete_sync(&self, account_id: AccountId) -> Result<()> {
        let dir = self.account_dir(account_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(account_id, path = %dir.display(), "Deleted stored credentials");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Per-account disk usage
    pub fn stats(&self) -> Result<StorageStats> {
        let mut accounts = Vec::new();
        for account_id in self.account_ids()? {
            let dir = self.account_dir(account_id);
            accounts.push(AccountUsage {
                account_id,
                bytes: dir_size(&dir)?,
                modified: modified_at(&dir).map(DateTime::<Utc>::from),
            });
        }

        Ok(StorageStats {
            session_dir: self.dir.clone(),
            total_accounts: accounts.len(),
            total_bytes: accounts.iter().map(|a| a.bytes).sum(),
            accounts,
        })
    }

    /// Delete credential directories untouched for longer than `max_age`
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<Vec<AccountId>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for account_id in self.account_ids()? {
            let dir = self.account_dir(account_id);
            let Some(modified) = modified_at(&dir) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                self.delete_sync(account_id)?;
                removed.push(account_id);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Cleaned up stale credential directories");
        }
        Ok(removed)
    }

    /// Copy an account's credential directory into `backup_dir`
    pub fn backup(&self, account_id: AccountId, backup_dir: &Path) -> Result<PathBuf> {
        let source = self.account_dir(account_id);
        if !source.exists() {
            return Err(Error::NoActiveSession(account_id));
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let target = backup_dir.join(format!("{}{}_{}", ACCOUNT_DIR_PREFIX, account_id, stamp));
        copy_dir(&source, &target)?;
        info!(account_id, path = %target.display(), "Backed up stored credentials");
        Ok(target)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, account_id: AccountId) -> Result<Option<StoredCredentials>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_sync(account_id))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn save(&self, credentials: &StoredCredentials) -> Result<()> {
        let store = self.clone();
        let credentials = credentials.clone();
        tokio::task::spawn_blocking(move || store.write_sync(&credentials))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn delete(&self, account_id: AccountId) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.delete_sync(account_id))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn list(&self) -> Result<Vec<StoredCredentials>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut all = Vec::new();
            for account_id in store.account_ids()? {
                match store.read_sync(account_id) {
                    Ok(Some(creds)) => all.push(creds),
                    Ok(None) => {}
                    Err(e) => warn!(account_id, error = %e, "Skipping unreadable credentials"),
                }
            }
            Ok(all)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    let dir_time = fs::metadata(path).and_then(|m| m.modified()).ok();
    let file_time = fs::metadata(path.join(CREDS_FILE))
        .and_then(|m| m.modified())
        .ok();
    dir_time.max(file_time)
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
