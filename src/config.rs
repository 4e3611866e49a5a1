//! Configuration, queue names and lifecycle policy

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Logical queue channels the worker consumes from and publishes to
#[derive(Debug, Clone, Serialize)]
pub struct QueueNames {
    pub message_send: String,
    pub message_receive: String,
    pub number_health: String,
    pub session_update: String,
    pub worker_events: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            message_send: "whatsapp.message.send".to_string(),
            message_receive: "whatsapp.message.receive".to_string(),
            number_health: "whatsapp.number.health".to_string(),
            session_update: "whatsapp.session.update".to_string(),
            worker_events: "whatsapp.worker.events".to_string(),
        }
    }
}

/// Timing and retry policy for session lifecycle and delivery
#[derive(Debug, Clone, Serialize)]
pub struct LifecyclePolicy {
    /// Authentication-challenge regenerations before giving up
    pub max_qr_retries: u32,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub query_timeout: Duration,
    /// First reconnect delay; doubles per consecutive attempt
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    pub health_check_interval: Duration,
    pub status_report_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_qr_retries: 3,
            connect_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(2),
            reconnect_backoff_max: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
            status_report_interval: Duration::from_secs(30),
        }
    }
}

impl LifecyclePolicy {
    /// Delay before reconnect attempt `attempt` (0-based), capped at the ceiling
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max)
    }
}

/// All configurable values for the worker
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub worker_id: String,
    pub worker_name: String,
    pub queues: QueueNames,
    pub session_dir: PathBuf,
    pub backend_url: Option<String>,
    #[serde(skip_serializing)]
    pub backend_api_key: String,
    pub log_level: String,
    /// Ignore session updates addressed to another worker
    pub only_own_session_updates: bool,
    pub policy: LifecyclePolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            worker_id: "worker-1".to_string(),
            worker_name: "Session Worker".to_string(),
            queues: QueueNames::default(),
            session_dir: data_dir.join("session-worker/sessions"),
            backend_url: None,
            backend_api_key: String::new(),
            log_level: "info".to_string(),
            only_own_session_updates: false,
            policy: LifecyclePolicy::default(),
        }
    }
}

impl Config {
    /// Build config from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WORKER_ID") {
            config.worker_id = v;
        }
        if let Some(v) = get("WORKER_NAME") {
            config.worker_name = v;
        }
        if let Some(v) = get("QUEUE_MESSAGE_SEND") {
            config.queues.message_send = v;
        }
        if let Some(v) = get("QUEUE_MESSAGE_RECEIVE") {
            config.queues.message_receive = v;
        }
        if let Some(v) = get("QUEUE_NUMBER_HEALTH") {
            config.queues.number_health = v;
        }
        if let Some(v) = get("QUEUE_SESSION_UPDATE") {
            config.queues.session_update = v;
        }
        if let Some(v) = get("QUEUE_WORKER_EVENTS") {
            config.queues.worker_events = v;
        }
        if let Some(v) = get("SESSION_DIR") {
            config.session_dir = PathBuf::from(v);
        }
        config.backend_url = get("BACKEND_API_URL");
        if let Some(v) = get("BACKEND_API_KEY") {
            config.backend_api_key = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = get("ONLY_OWN_SESSION_UPDATES") {
            config.only_own_session_updates = parse_bool("ONLY_OWN_SESSION_UPDATES", &v)?;
        }

        let policy = &mut config.policy;
        if let Some(v) = get("MAX_RETRY_ATTEMPTS") {
            policy.max_qr_retries = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("MAX_RETRY_ATTEMPTS: invalid value {:?}", v)))?;
        }
        let millis = |key: &str, target: &mut Duration| -> Result<()> {
            if let Some(v) = get(key) {
                *target = parse_millis(key, &v)?;
            }
            Ok(())
        };
        millis("MESSAGE_TIMEOUT", &mut policy.send_timeout)?;
        millis("CONNECT_TIMEOUT", &mut policy.connect_timeout)?;
        millis("QUERY_TIMEOUT", &mut policy.query_timeout)?;
        millis("HEALTH_CHECK_INTERVAL", &mut policy.health_check_interval)?;
        millis("STATUS_REPORT_INTERVAL", &mut policy.status_report_interval)?;
        millis("RECONNECT_BACKOFF", &mut policy.reconnect_backoff)?;
        millis("RECONNECT_BACKOFF_MAX", &mut policy.reconnect_backoff_max)?;

        Ok(config)
    }

    /// Create config for testing with custom paths and short timers
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            worker_id: "test-worker".to_string(),
            worker_name: "Test Worker".to_string(),
            queues: QueueNames::default(),
            session_dir: temp_dir.join("sessions"),
            backend_url: None,
            backend_api_key: String::new(),
            log_level: "debug".to_string(),
            only_own_session_updates: false,
            policy: LifecyclePolicy {
                max_qr_retries: 3,
                connect_timeout: Duration::from_secs(2),
                send_timeout: Duration::from_secs(2),
                query_timeout: Duration::from_secs(2),
                reconnect_backoff: Duration::from_millis(10),
                reconnect_backoff_max: Duration::from_millis(40),
                health_check_interval: Duration::from_secs(60),
                status_report_interval: Duration::from_secs(30),
            },
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::Config(format!("{}: expected milliseconds, got {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{}: expected boolean, got {:?}", key, value))),
    }
}
