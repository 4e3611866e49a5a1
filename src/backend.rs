//! HTTP client for the optional backend API
//!
//! Everything except worker registration is best-effort: a backend outage is
//! logged and otherwise ignored so it never blocks message delivery.

use crate::config::Config;
use crate::error::Result;
use crate::events::now_millis;
use crate::health::WorkerStatus;
use crate::session::{AccountId, SessionState};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WORKER_ID_HEADER: &str = "X-Worker-ID";
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration<'a> {
    worker_id: &'a str,
    worker_name: &'a str,
    version: &'a str,
    capabilities: [&'a str; 3],
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    worker_id: String,
    worker_name: String,
    api_key: String,
    http: Client,
}

impl BackendClient {
    pub fn new(base_url: &str, config: &Config) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id: config.worker_id.clone(),
            worker_name: config.worker_name.clone(),
            api_key: config.backend_api_key.clone(),
            http,
        })
    }

    /// Client for the configured backend, if one is configured
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        config
            .backend_url
            .as_deref()
            .map(|url| Self::new(url, config))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .post(url.as_str())
            .header(WORKER_ID_HEADER, &self.worker_id)
            .json(body);
        if !self.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &self.api_key);
        }

        request.send().await?.error_for_status()?;
        debug!(url = %url, "Backend request succeeded");
        Ok(())
    }

    async fn post_best_effort<T: Serialize + ?Sized>(&self, path: &str, body: &T) {
        if let Err(e) = self.post(path, body).await {
            warn!(path, error = %e, "Backend request failed");
        }
    }

    /// Announce this worker; callers decide whether failure is fatal
    pub async fn register_worker(&self) -> Result<()> {
        let registration = Registration {
            worker_id: &self.worker_id,
            worker_name: &self.worker_name,
            version: env!("CARGO_PKG_VERSION"),
            capabilities: ["text", "media", "qr"],
        };
        self.post("/workers/register", &registration).await?;
        info!(worker_id = %self.worker_id, "Registered with backend");
        Ok(())
    }

    pub async fn heartbeat(&self) {
        self.post_best_effort(
            "/workers/heartbeat",
            &json!({ "workerId": self.worker_id, "timestamp": now_millis() }),
        )
        .await;
    }

    pub async fn update_worker_status(&self, status: &WorkerStatus) {
        self.post_best_effort("/workers/status", status).await;
    }

    pub async fn report_session_status(
        &self,
        account_id: AccountId,
        session_id: &str,
        state: SessionState,
    ) {
        self.post_best_effort(
            "/sessions/status",
            &json!({
                "workerId": self.worker_id,
                "accountId": account_id,
                "sessionId": session_id,
                "status": state,
                "timestamp": now_millis(),
            }),
        )
        .await;
    }

    pub async fn report_error(&self, context: &str, error: &crate::Error) {
        self.post_best_effort(
            "/errors/report",
            &json!({
                "workerId": self.worker_id,
                "context": context,
                "error": error.to_string(),
                "errorCode": error.code(),
                "temporary": error.is_temporary(),
                "timestamp": now_millis(),
            }),
        )
        .await;
    }
}
