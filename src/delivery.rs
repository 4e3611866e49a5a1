//! Delivery engine - routes one outbound message through an account's session
//!
//! A recipient may have several valid encodings (see [`crate::numbering`]).
//! Candidates are tried in order and only a "recipient not found" failure
//! moves on to the next one.

use crate::classify::{classify_send_failure, SendFailure};
use crate::client::OutboundContent;
use crate::config::LifecyclePolicy;
use crate::error::{Error, Result};
use crate::numbering::NumberingPlan;
use crate::registry::SessionRegistry;
use crate::session::AccountId;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message id reported when the service accepted the body but the client
/// failed before returning an id
pub const UNKNOWN_MESSAGE_ID: &str = "UNKNOWN_ID";

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub message_id: String,
    /// Address that accepted the message
    pub recipient: String,
    /// Candidates tried, including the successful one
    pub attempts: usize,
    /// Set when success was inferred from a benign client failure
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    registry: SessionRegistry,
    plan: NumberingPlan,
    send_timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(registry: SessionRegistry, plan: NumberingPlan, policy: &LifecyclePolicy) -> Self {
        Self {
            registry,
            plan,
            send_timeout: policy.send_timeout,
        }
    }

    pub fn plan(&self) -> &NumberingPlan {
        &self.plan
    }

    /// Send `body` of `kind` to `recipient` through the account's session
    pub async fn send(
        &self,
        account_id: AccountId,
        recipient: &str,
        kind: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let session = self.registry.get(account_id)?;
        let _guard = self.registry.lock_account(account_id).await;

        // Closed or replaced while waiting for the lock
        if !self.registry.is_current(&session) || !session.is_ready() {
            return Err(Error::SessionNotConnected(account_id));
        }

        let content = OutboundContent::build(kind, body, media_url)?;
        let candidates = self.plan.addresses(recipient);
        debug!(account_id, kind = %content.kind(), candidates = candidates.len(), "Sending message");

        let mut last_not_found = None;
        for (index, address) in candidates.iter().enumerate() {
            let attempt = tokio::time::timeout(self.send_timeout, session.send(address, &content)).await;

            let err = match attempt {
                Ok(Ok(message)) => {
                    info!(account_id, recipient = %address, message_id = %message.id, "Message sent");
                    return Ok(DeliveryReceipt {
                        message_id: message.id,
                        recipient: address.clone(),
                        attempts: index + 1,
                        warning: None,
                    });
                }
                Ok(Err(Error::Client(err))) => err,
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: "send",
                        after: self.send_timeout,
                    })
                }
            };

            match classify_send_failure(&err) {
                SendFailure::BenignConfirmation => {
                    warn!(
                        account_id,
                        recipient = %address,
                        error = %err,
                        "Ignoring post-send confirmation error, reporting success"
                    );
                    return Ok(DeliveryReceipt {
                        message_id: UNKNOWN_MESSAGE_ID.to_string(),
                        recipient: address.clone(),
                        attempts: index + 1,
                        warning: Some("markedUnread".to_string()),
                    });
                }
                SendFailure::RecipientNotFound => {
                    debug!(account_id, recipient = %address, error = %err, "Candidate not found, trying next");
                    last_not_found = Some(err.message);
                }
                SendFailure::Transient => return Err(Error::TransientNetwork(err.message)),
                SendFailure::Other => return Err(Error::Client(err)),
            }
        }

        Err(Error::InvalidRecipient {
            recipient: recipient.to_string(),
            reason: last_not_found.unwrap_or_else(|| "no candidate addresses".to_string()),
        })
    }
}
