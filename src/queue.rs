//! Queue transport seam
//!
//! The broker connection itself lives outside this crate. The worker needs two
//! things from it: a way to publish JSON payloads to a named channel, and a
//! decision per consumed message on whether to ack, requeue or drop it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<()>;
}

/// What the transport should do with a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

impl Disposition {
    /// Temporary failures are requeued; everything else is dropped
    pub fn for_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Disposition::Ack,
            Err(e) => Disposition::Nack {
                requeue: e.is_temporary(),
            },
        }
    }
}

/// A payload captured by [`MemoryPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// In-process publisher that records everything it is given
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<Published>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish to `channel` fail
    pub fn fail_channel(&self, channel: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Payloads published to one channel, in order
    pub fn on(&self, channel: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|p| p.channel == channel)
            .map(|p| p.payload)
            .collect()
    }

    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<()> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(channel);
        if failing {
            return Err(Error::TransientNetwork(format!("publish to {} refused", channel)));
        }

        debug!(channel, "Message published");
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Published {
                channel: channel.to_string(),
                payload: payload.clone(),
            });
        Ok(())
    }
}
