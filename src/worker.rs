//! Queue dispatch - ties the registry, lifecycle, delivery and health
//! components to the consumed channels
//!
//! The queue transport hands each consumed payload to [`Worker::dispatch`] and
//! acks or nacks according to the returned [`Disposition`].

use crate::backend::BackendClient;
use crate::classify;
use crate::client::ClientConnector;
use crate::config::Config;
use crate::delivery::{DeliveryEngine, DeliveryReceipt};
use crate::error::{Error, Result};
use crate::events::{
    now_millis, DeliveryStatus, EventSink, HealthCheckRequest, MessageStatusEvent, SendRequest,
    SessionUpdate,
};
use crate::health::{HealthMonitor, WorkerStatus};
use crate::lifecycle::LifecycleController;
use crate::numbering::NumberingPlan;
use crate::queue::{Disposition, Publisher};
use crate::registry::SessionRegistry;
use crate::session::SessionSnapshot;
use crate::store::CredentialStore;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKER_STATUS_ACTION: &str = "worker_status";
const HEALTH_CHECK_ACTION: &str = "health_check";

/// The worker process core; cheap to clone
#[derive(Clone)]
pub struct Worker {
    config: Config,
    registry: SessionRegistry,
    lifecycle: LifecycleController,
    delivery: DeliveryEngine,
    health: HealthMonitor,
    events: EventSink,
    backend: Option<BackendClient>,
    started: Instant,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Worker {
    pub fn new(
        config: Config,
        connector: Arc<dyn ClientConnector>,
        store: Arc<dyn CredentialStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let registry = SessionRegistry::new();
        let events = EventSink::new(publisher, config.queues.clone(), &config.worker_id);
        let lifecycle = LifecycleController::new(
            registry.clone(),
            connector,
            store,
            events.clone(),
            config.policy.clone(),
        );
        let delivery = DeliveryEngine::new(registry.clone(), NumberingPlan::default(), &config.policy);
        let health = HealthMonitor::new(registry.clone(), events.clone(), &config.policy);
        let backend = BackendClient::from_config(&config)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            lifecycle,
            delivery,
            health,
            events,
            backend,
            started: Instant::now(),
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Register with the backend, restore stored sessions and start timers
    ///
    /// Returns the number of restored sessions.
    pub async fn start(&self) -> usize {
        info!(worker_id = %self.config.worker_id, "Starting worker");

        if let Some(backend) = &self.backend {
            if let Err(e) = backend.register_worker().await {
                warn!(error = %e, "Backend registration failed, continuing without it");
            }
        }

        let restored = self.lifecycle.restore_all().await;

        let health_task = self.health.clone().spawn(self.shutdown.subscribe());
        let status_task = self.spawn_status_reporter();
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([health_task, status_task]);

        info!(restored, "Worker started");
        restored
    }

    /// Stop timers and release every session
    pub async fn shutdown(&self) {
        info!("Shutting down worker");
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }

        self.lifecycle.shutdown().await;
        info!("Worker stopped");
    }

    /// Current aggregate status
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::collect(
            &self.registry,
            &self.config.worker_id,
            &self.config.worker_name,
            self.started,
        )
    }

    pub async fn report_status(&self) {
        let status = self.status();
        debug!(
            total = status.total_sessions,
            connected = status.connected_sessions,
            "Reporting worker status"
        );
        self.events.worker_status(&status).await;
        if let Some(backend) = &self.backend {
            backend.heartbeat().await;
            backend.update_worker_status(&status).await;
        }
    }

    fn spawn_status_reporter(&self) -> JoinHandle<()> {
        let worker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.policy.status_report_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => worker.report_status().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Process one consumed payload and decide its fate
    pub async fn dispatch(&self, channel: &str, payload: &[u8]) -> Disposition {
        let queues = &self.config.queues;
        let result = if channel == queues.message_send {
            self.dispatch_send(payload).await
        } else if channel == queues.session_update {
            match parse::<SessionUpdate>(payload) {
                Ok(update) => self.handle_session_update(update).await,
                Err(e) => Err(e),
            }
        } else if channel == queues.number_health {
            match parse::<HealthCheckRequest>(payload) {
                Ok(request) => self.handle_health_request(request).await,
                Err(e) => Err(e),
            }
        } else {
            Err(Error::InvalidPayload(format!("unknown channel {}", channel)))
        };

        if let Err(e) = &result {
            error!(
                channel,
                error = %e,
                code = e.code(),
                temporary = e.is_temporary(),
                "Failed to process message"
            );
        }
        Disposition::for_result(&result)
    }

    async fn dispatch_send(&self, payload: &[u8]) -> Result<()> {
        match parse::<SendRequest>(payload) {
            Ok(request) => self.handle_send(request).await.map(|_| ()),
            Err(e) => {
                // Report against the message id when the payload carries one
                let message_id = serde_json::from_slice::<serde_json::Value>(payload)
                    .ok()
                    .and_then(|v| v.get("messageId").cloned());
                if let Some(message_id) = message_id {
                    self.publish_failed(message_id, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Deliver one message and publish exactly one status event for it
    pub async fn handle_send(&self, request: SendRequest) -> Result<DeliveryReceipt> {
        let recipient: String = request
            .recipient_number
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let result = self
            .delivery
            .send(
                request.account_id,
                &recipient,
                &request.kind,
                &request.content,
                request.media_url.as_deref(),
            )
            .await;

        match &result {
            Ok(receipt) => {
                let event = MessageStatusEvent {
                    message_id: request.message_id.clone(),
                    status: DeliveryStatus::Sent,
                    whatsapp_message_id: Some(receipt.message_id.clone()),
                    warning: receipt.warning.clone(),
                    error_message: None,
                    error_code: None,
                    temporary: None,
                    timestamp: now_millis(),
                };
                self.events.message_status(&event).await;
            }
            Err(e) => {
                self.publish_failed(request.message_id.clone(), e).await;

                let text = e.to_string();
                if classify::indicates_ban(&text) {
                    self.health.report_banned(request.account_id, &text).await;
                }
                if let Some(backend) = &self.backend {
                    backend.report_error("message_send", e).await;
                }
            }
        }
        result
    }

    async fn publish_failed(&self, message_id: serde_json::Value, err: &Error) {
        let event = MessageStatusEvent {
            message_id,
            status: DeliveryStatus::Failed,
            whatsapp_message_id: None,
            warning: None,
            error_message: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
            temporary: Some(err.is_temporary()),
            timestamp: now_millis(),
        };
        self.events.message_status(&event).await;
    }

    /// Apply a session-update command
    pub async fn handle_session_update(&self, update: SessionUpdate) -> Result<()> {
        let action = update.action.as_str();
        if action == WORKER_STATUS_ACTION {
            return Ok(());
        }

        let data = update.data;
        if self.config.only_own_session_updates {
            if let Some(target) = data.worker_id.as_deref() {
                if target != self.config.worker_id {
                    debug!(action, target, "Ignoring session update for another worker");
                    return Ok(());
                }
            }
        }

        let account_id = data
            .account_id
            .ok_or_else(|| Error::InvalidPayload("accountId is required".to_string()))?;
        let phone_number = data.phone_number.as_deref();
        info!(action, account_id, "Session update");

        let snapshot: Option<SessionSnapshot> = match action {
            "create" => {
                let phone_number = phone_number
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Error::InvalidPayload("phoneNumber is required".to_string()))?;
                Some(self.lifecycle.create(account_id, phone_number).await?)
            }
            "close" => {
                self.lifecycle.close(account_id).await?;
                None
            }
            "reconnect" => Some(self.lifecycle.reconnect(account_id, phone_number).await?),
            "regenerate_qr" => Some(self.lifecycle.regenerate_qr(account_id, phone_number).await?),
            other => {
                return Err(Error::InvalidPayload(format!(
                    "unknown session action {}",
                    other
                )))
            }
        };

        if let (Some(backend), Some(snapshot)) = (&self.backend, snapshot) {
            backend
                .report_session_status(snapshot.account_id, &snapshot.session_id, snapshot.state)
                .await;
        }
        Ok(())
    }

    /// Answer an on-demand health request
    pub async fn handle_health_request(&self, request: HealthCheckRequest) -> Result<()> {
        if request.action != HEALTH_CHECK_ACTION {
            return Err(Error::InvalidPayload(format!(
                "unknown health action {}",
                request.action
            )));
        }
        match request.account_id {
            Some(account_id) => {
                self.health.probe(account_id).await;
            }
            None => {
                self.health.check_all().await;
            }
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::InvalidPayload(e.to_string()))
}
