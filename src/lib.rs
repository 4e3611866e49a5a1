//! Session worker
//!
//! Bridges a message queue to many concurrent chat-client sessions, one per
//! account: routes send requests to the right session, drives session
//! lifecycle from control messages and client events, and reports health.

pub mod backend;
pub mod classify;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod numbering;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
pub use worker::Worker;
