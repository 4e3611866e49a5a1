//! Integration tests for the session worker
//!
//! These drive the worker through `dispatch` the way the queue transport
//! does, with a scripted chat client and the in-memory publisher.

use assert_cmd::Command;
use async_trait::async_trait;
use predicates::prelude::*;
use serde_json::{json, Value};
use session_worker::client::{
    ChatHandle, ClientConnector, ClientError, ClientEvent, ConnectRequest, Connection,
    ConnectionState, DisconnectReason, MessageRef, OutboundContent, EVENT_CHANNEL_CAPACITY,
};
use session_worker::config::Config;
use session_worker::queue::{Disposition, MemoryPublisher};
use session_worker::session::{AccountId, SessionState};
use session_worker::store::FileCredentialStore;
use session_worker::Worker;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ============================================================================
// Scripted chat client
// ============================================================================

#[derive(Default)]
struct Script {
    /// Send failures keyed by recipient address
    send_failures: HashMap<String, ClientError>,
    /// Accounts whose liveness probe errors
    broken_probes: HashSet<AccountId>,
    /// Every (account, address) send attempt, in order
    attempts: Vec<(AccountId, String)>,
    connects: Vec<ConnectRequest>,
    senders: HashMap<AccountId, mpsc::Sender<ClientEvent>>,
}

#[derive(Clone, Default)]
struct ScriptedClient {
    script: Arc<Mutex<Script>>,
}

impl ScriptedClient {
    fn fail_send(&self, address: &str, err: ClientError) {
        self.script
            .lock()
            .unwrap()
            .send_failures
            .insert(address.to_string(), err);
    }

    fn break_probe(&self, account_id: AccountId) {
        self.script.lock().unwrap().broken_probes.insert(account_id);
    }

    fn attempts(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|(_, address)| address.clone())
            .collect()
    }

    fn connects(&self) -> usize {
        self.script.lock().unwrap().connects.len()
    }

    async fn emit(&self, account_id: AccountId, event: ClientEvent) {
        let sender = self
            .script
            .lock()
            .unwrap()
            .senders
            .get(&account_id)
            .cloned()
            .expect("no connection for account");
        sender.send(event).await.unwrap();
    }
}

struct ScriptedHandle {
    account_id: AccountId,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl ChatHandle for ScriptedHandle {
    async fn send_content(
        &self,
        recipient: &str,
        _content: &OutboundContent,
    ) -> Result<MessageRef, ClientError> {
        let mut script = self.script.lock().unwrap();
        script.attempts.push((self.account_id, recipient.to_string()));
        match script.send_failures.get(recipient) {
            Some(err) => Err(err.clone()),
            None => Ok(MessageRef {
                id: format!("wamid.{}", script.attempts.len()),
            }),
        }
    }

    async fn connection_state(&self) -> Result<ConnectionState, ClientError> {
        if self.script.lock().unwrap().broken_probes.contains(&self.account_id) {
            return Err(ClientError::new("probe exploded"));
        }
        Ok(ConnectionState::Open)
    }

    async fn logout(&self) -> Result<(), ClientError> {
        Err(ClientError::new("Intentional Logout"))
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

#[async_trait]
impl ClientConnector for ScriptedClient {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, ClientError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let account_id = request.account_id;
        let qr = {
            let mut script = self.script.lock().unwrap();
            script.connects.push(request);
            script.senders.insert(account_id, tx.clone());
            format!("qr-{}-{}", account_id, script.connects.len())
        };
        tx.try_send(ClientEvent::Qr(qr)).unwrap();

        Ok(Connection {
            handle: Box::new(ScriptedHandle {
                account_id,
                script: self.script.clone(),
            }),
            events: rx,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    worker: Worker,
    client: ScriptedClient,
    publisher: Arc<MemoryPublisher>,
    config: Config,
    _temp: TempDir,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let client = ScriptedClient::default();
        let publisher = Arc::new(MemoryPublisher::new());
        let store = Arc::new(FileCredentialStore::new(&config.session_dir));
        let worker = Worker::new(
            config.clone(),
            Arc::new(client.clone()),
            store,
            publisher.clone(),
        )
        .unwrap();

        Self {
            worker,
            client,
            publisher,
            config,
            _temp: temp,
        }
    }

    async fn dispatch(&self, channel: &str, payload: Value) -> Disposition {
        self.worker
            .dispatch(channel, &serde_json::to_vec(&payload).unwrap())
            .await
    }

    async fn session_update(&self, action: &str, data: Value) -> Disposition {
        let channel = self.config.queues.session_update.clone();
        self.dispatch(&channel, json!({ "action": action, "data": data }))
            .await
    }

    async fn send(&self, account_id: AccountId, recipient: &str) -> Disposition {
        let channel = self.config.queues.message_send.clone();
        self.dispatch(
            &channel,
            json!({
                "messageId": "m-1",
                "recipientNumber": recipient,
                "content": "hello",
                "type": "text",
                "accountId": account_id
            }),
        )
        .await
    }

    fn worker_events(&self, action: &str) -> Vec<Value> {
        self.publisher
            .on(&self.config.queues.worker_events)
            .into_iter()
            .filter(|e| e["action"] == action)
            .collect()
    }

    fn statuses(&self) -> Vec<Value> {
        self.publisher.on(&self.config.queues.message_receive)
    }

    fn health(&self) -> Vec<Value> {
        self.publisher.on(&self.config.queues.number_health)
    }

    async fn wait_for(&self, action: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.worker_events(action).len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} x{}",
                action,
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Create a session and drive it to Ready
    async fn ready_session(&self, account_id: AccountId) {
        let before = self.worker_events("connected").len();
        let disposition = self
            .session_update(
                "create",
                json!({ "accountId": account_id, "phoneNumber": "2250700000000" }),
            )
            .await;
        assert_eq!(disposition, Disposition::Ack);

        self.client.emit(account_id, ClientEvent::Open).await;
        self.wait_for("connected", before + 1).await;
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Ready session, new-format number: the first candidate succeeds
#[tokio::test]
async fn test_send_to_ready_session() {
    let h = Harness::new();
    h.ready_session(6).await;

    assert_eq!(h.send(6, "2250709865432").await, Disposition::Ack);

    assert_eq!(h.client.attempts(), vec!["2250709865432@c.us"]);
    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["messageId"], "m-1");
    assert_eq!(statuses[0]["status"], "SENT");
    assert!(statuses[0]["whatsappMessageId"].is_string());
}

/// A "not registered" candidate falls through; later candidates are untouched
#[tokio::test]
async fn test_candidate_fallback_stops_at_success() {
    let h = Harness::new();
    h.ready_session(6).await;
    h.client
        .fail_send("22509865432@c.us", ClientError::new("not registered"));

    assert_eq!(h.send(6, "22509865432").await, Disposition::Ack);
    assert_eq!(
        h.client.attempts(),
        vec!["22509865432@c.us", "2250709865432@c.us"]
    );
    assert_eq!(h.statuses()[0]["status"], "SENT");
}

#[tokio::test]
async fn test_recipient_whitespace_is_ignored() {
    let h = Harness::new();
    h.ready_session(6).await;

    assert_eq!(h.send(6, " 225 07 09 86 54 32 ").await, Disposition::Ack);
    assert_eq!(h.client.attempts(), vec!["2250709865432@c.us"]);
}

/// No session: one FAILED event, no network attempt, no requeue
#[tokio::test]
async fn test_send_without_session() {
    let h = Harness::new();

    assert_eq!(
        h.send(6, "2250709865432").await,
        Disposition::Nack { requeue: false }
    );
    assert!(h.client.attempts().is_empty());

    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["status"], "FAILED");
    assert_eq!(statuses[0]["errorCode"], "NO_ACTIVE_SESSION");
    assert_eq!(statuses[0]["temporary"], false);
}

/// A session still waiting for its challenge cannot send yet, but may later
#[tokio::test]
async fn test_send_before_ready_is_requeued() {
    let h = Harness::new();
    h.session_update("create", json!({ "accountId": 6, "phoneNumber": "2250700000000" }))
        .await;
    h.wait_for("qr_generated", 1).await;

    assert_eq!(
        h.send(6, "2250709865432").await,
        Disposition::Nack { requeue: true }
    );
    assert_eq!(h.statuses()[0]["temporary"], true);
}

#[tokio::test]
async fn test_ban_text_flags_account() {
    let h = Harness::new();
    h.ready_session(6).await;
    h.client.fail_send(
        "2250709865432@c.us",
        ClientError::new("account banned by service"),
    );

    assert_eq!(
        h.send(6, "2250709865432").await,
        Disposition::Nack { requeue: false }
    );
    assert_eq!(h.statuses().len(), 1);
    let banned: Vec<_> = h
        .health()
        .into_iter()
        .filter(|r| r["status"] == "BANNED")
        .collect();
    assert_eq!(banned.len(), 1);
    assert_eq!(banned[0]["accountId"], 6);
}

#[tokio::test]
async fn test_media_without_url_is_permanent() {
    let h = Harness::new();
    h.ready_session(6).await;

    let channel = h.config.queues.message_send.clone();
    let disposition = h
        .dispatch(
            &channel,
            json!({
                "messageId": 7,
                "recipientNumber": "2250709865432",
                "content": "caption",
                "type": "image",
                "whatsappNumberId": "6"
            }),
        )
        .await;

    assert_eq!(disposition, Disposition::Nack { requeue: false });
    assert!(h.client.attempts().is_empty());
    assert_eq!(h.statuses()[0]["errorCode"], "MISSING_MEDIA");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_emits_one_qr() {
    let h = Harness::new();
    let disposition = h
        .session_update("create", json!({ "accountId": 6, "phoneNumber": "2250709865432" }))
        .await;
    assert_eq!(disposition, Disposition::Ack);

    h.wait_for("qr_generated", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let qr = h.worker_events("qr_generated");
    assert_eq!(qr.len(), 1);
    assert_eq!(qr[0]["sessionId"], "session_6_2250709865432");
    let session = h.worker.registry().get(6).unwrap();
    assert_eq!(session.state(), SessionState::AwaitingAuth);
}

#[tokio::test]
async fn test_qr_expiry_is_bounded() {
    let h = Harness::new();
    h.session_update("create", json!({ "accountId": 6, "phoneNumber": "2250709865432" }))
        .await;

    let max = h.config.policy.max_qr_retries as usize;
    for round in 1..=max + 1 {
        h.wait_for("qr_generated", round).await;
        h.client
            .emit(6, ClientEvent::Closed(DisconnectReason::ChallengeExpired))
            .await;
    }
    h.wait_for("error", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.worker_events("qr_regenerating").len(), max);
    assert_eq!(h.worker_events("error").len(), 1);
    assert_eq!(h.client.connects(), max + 1);
    assert!(h.worker.registry().find(6).is_none());
}

#[tokio::test]
async fn test_close_unknown_account_is_noop() {
    let h = Harness::new();
    assert_eq!(
        h.session_update("close", json!({ "accountId": 404 })).await,
        Disposition::Ack
    );
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn test_close_emits_one_terminal_event() {
    let h = Harness::new();
    h.ready_session(6).await;

    assert_eq!(
        h.session_update("close", json!({ "accountId": 6 })).await,
        Disposition::Ack
    );
    assert_eq!(h.worker_events("disconnected").len(), 1);
    assert!(h.worker.registry().is_empty());

    // Sends after close see no session
    assert_eq!(
        h.send(6, "2250709865432").await,
        Disposition::Nack { requeue: false }
    );
}

#[tokio::test]
async fn test_transient_drop_recovers() {
    let h = Harness::new();
    h.ready_session(6).await;

    h.client
        .emit(
            6,
            ClientEvent::Closed(DisconnectReason::StreamError("restart required".into())),
        )
        .await;
    h.wait_for("qr_generated", 2).await;

    assert_eq!(h.client.connects(), 2);
    assert_eq!(h.worker.registry().len(), 1);
    assert!(h.worker_events("error").is_empty());
}

#[tokio::test]
async fn test_inbound_messages_are_forwarded() {
    let h = Harness::new();
    h.ready_session(6).await;

    h.client
        .emit(
            6,
            ClientEvent::Message(session_worker::client::InboundMessage {
                id: Some("in-1".into()),
                from: "2250711111111@c.us".into(),
                body: "hi there".into(),
                timestamp: 1_700_000_000,
                has_media: false,
                kind: "chat".into(),
            }),
        )
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.statuses().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let inbound = &h.statuses()[0];
    assert_eq!(inbound["accountId"], 6);
    assert_eq!(inbound["body"], "hi there");
    assert_eq!(inbound["hasMedia"], false);
    assert_eq!(inbound["type"], "chat");
}

/// Two create requests for one account racing through the queue
#[tokio::test]
async fn test_concurrent_create_dispatches_keep_one_session() {
    let h = Harness::new();
    let data = json!({ "accountId": 6, "phoneNumber": "2250709865432" });
    let (first, second) = tokio::join!(
        h.session_update("create", data.clone()),
        h.session_update("create", data),
    );
    assert_eq!(first, Disposition::Ack);
    assert_eq!(second, Disposition::Ack);

    h.wait_for("qr_generated", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.client.connects(), 1);
    assert_eq!(h.worker.registry().len(), 1);
    assert_eq!(h.worker_events("qr_generated").len(), 1);
}

/// A create and a reconnect for one account racing through the queue
#[tokio::test]
async fn test_create_racing_reconnect_dispatch_keeps_one_session() {
    let h = Harness::new();
    let data = json!({ "accountId": 6, "phoneNumber": "2250709865432" });
    let (created, reconnected) = tokio::join!(
        h.session_update("create", data.clone()),
        h.session_update("reconnect", data),
    );
    assert_eq!(created, Disposition::Ack);
    assert_eq!(reconnected, Disposition::Ack);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.worker.registry().len(), 1);
    let surviving = format!("qr-6-{}", h.client.connects());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.worker.registry().get(6).unwrap().last_qr().as_deref() != Some(surviving.as_str()) {
        assert!(tokio::time::Instant::now() < deadline, "surviving session never got its QR");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let published = h
        .worker_events("qr_generated")
        .into_iter()
        .filter(|e| e["qrCode"] == surviving.as_str())
        .count();
    assert_eq!(published, 1);
}

// ============================================================================
// Health
// ============================================================================

/// One failing probe does not stop the others
#[tokio::test]
async fn test_health_check_isolates_failures() {
    let h = Harness::new();
    for account_id in 1..=3 {
        h.ready_session(account_id).await;
    }
    h.client.break_probe(2);
    h.publisher.clear();

    let channel = h.config.queues.number_health.clone();
    assert_eq!(
        h.dispatch(&channel, json!({ "action": "health_check" })).await,
        Disposition::Ack
    );

    let mut records = h.health();
    records.sort_by_key(|r| r["accountId"].as_i64());
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["status"], "HEALTHY");
    assert_eq!(records[1]["status"], "UNHEALTHY");
    assert_eq!(records[2]["status"], "HEALTHY");
    assert!(records.iter().all(|r| r["workerId"] == "test-worker"));
}

#[tokio::test]
async fn test_probe_reports_disconnected_and_missing() {
    let h = Harness::new();
    h.session_update("create", json!({ "accountId": 6, "phoneNumber": "2250700000000" }))
        .await;
    h.wait_for("qr_generated", 1).await;

    let channel = h.config.queues.number_health.clone();
    h.dispatch(&channel, json!({ "action": "health_check", "accountId": 6 }))
        .await;
    h.dispatch(&channel, json!({ "action": "health_check", "accountId": "7" }))
        .await;

    let records = h.health();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["status"], "DISCONNECTED");
    assert_eq!(records[1]["status"], "NOT_FOUND");
}

// ============================================================================
// Startup / shutdown
// ============================================================================

#[tokio::test]
async fn test_restart_restores_stored_sessions() {
    let h = Harness::new();
    h.ready_session(6).await;
    h.client
        .emit(6, ClientEvent::CredentialsUpdated(json!({ "noise": "k" })))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.worker.shutdown().await;
    assert!(h.worker.registry().is_empty());

    let store = Arc::new(FileCredentialStore::new(&h.config.session_dir));
    let worker = Worker::new(
        h.config.clone(),
        Arc::new(h.client.clone()),
        store,
        h.publisher.clone(),
    )
    .unwrap();
    assert_eq!(worker.start().await, 1);

    let last = h.client.script.lock().unwrap().connects.last().cloned().unwrap();
    assert_eq!(last.account_id, 6);
    assert_eq!(last.credentials, Some(json!({ "noise": "k" })));
    worker.shutdown().await;
}

// ============================================================================
// CLI
// ============================================================================

fn cli(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("session-worker").unwrap();
    cmd.env("SESSION_DIR", temp.path().join("sessions"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_resolve_old_format() {
    let temp = TempDir::new().unwrap();
    cli(&temp)
        .args(["resolve", "+225 09 86 54 32"])
        .assert()
        .success()
        .stdout(
            "22509865432@c.us\n2250709865432@c.us\n2250509865432@c.us\n2250109865432@c.us\n",
        );
}

#[test]
fn test_cli_config_reflects_env() {
    let temp = TempDir::new().unwrap();
    cli(&temp)
        .env("WORKER_ID", "worker-cli")
        .env("BACKEND_API_KEY", "hidden-key")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"worker_id\": \"worker-cli\""))
        .stdout(predicate::str::contains("hidden-key").not());
}

#[test]
fn test_cli_rejects_bad_config() {
    let temp = TempDir::new().unwrap();
    cli(&temp)
        .env("MESSAGE_TIMEOUT", "soon")
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MESSAGE_TIMEOUT"));
}

#[test]
fn test_cli_sessions_list_empty() {
    let temp = TempDir::new().unwrap();
    cli(&temp)
        .args(["sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No stored sessions"));
}

#[test]
fn test_cli_backup_missing_account_fails() {
    let temp = TempDir::new().unwrap();
    let backups = temp.path().join("backups");
    cli(&temp)
        .args(["sessions", "backup", "9"])
        .arg(&backups)
        .assert()
        .failure()
        .stderr(predicate::str::contains("backup of account 9 failed"));
}
