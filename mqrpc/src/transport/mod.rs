//! Broker transport seam.
//!
//! The RPC engine only needs queues that can be created and deleted, a single
//! consumer per queue and producers that send to a named destination. Any
//! broker offering that much can sit behind these traits; `memory` is the
//! in-process implementation used by the tests and the demo.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Payload, Result};

pub mod memory;

/// Property stamped by the broker with the authenticated sender.
pub const VALIDATED_USER: &str = "validated-user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    String(String),
    Long(i64),
    Int(i32),
    Bytes(Bytes),
}

/// Message as the broker sees it: a property bag plus an opaque body.
#[derive(Debug, Clone, Default)]
pub struct TransportMessage {
    properties: HashMap<String, Property, RandomState>,
    pub body: Payload,
}

impl TransportMessage {
    pub fn put_string(&mut self, key: &str, value: impl Into<String>) {
        self.properties
            .insert(key.to_string(), Property::String(value.into()));
    }

    pub fn put_long(&mut self, key: &str, value: i64) {
        self.properties.insert(key.to_string(), Property::Long(value));
    }

    pub fn put_int(&mut self, key: &str, value: i32) {
        self.properties.insert(key.to_string(), Property::Int(value));
    }

    pub fn put_bytes(&mut self, key: &str, value: Bytes) {
        self.properties.insert(key.to_string(), Property::Bytes(value));
    }

    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(Property::String(value)) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.properties.get(key) {
            Some(Property::Long(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.properties.get(key) {
            Some(Property::Int(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        match self.properties.get(key) {
            Some(Property::Bytes(value)) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }
}

/// Broker endpoint, e.g. `broker-a:10000`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BrokerAddress(pub String);

impl From<&str> for BrokerAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Callback invoked for every message a consumer receives, in queue order.
pub type MessageHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// One authenticated connection to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// User this connection authenticated as.
    fn username(&self) -> &str;

    /// Creates a temporary queue owned by this connection.
    async fn create_queue(&self, address: &str) -> Result<()>;

    async fn delete_queue(&self, address: &str) -> Result<()>;

    /// Attaches the single consumer of `address`. Messages already queued are
    /// delivered first.
    async fn create_consumer(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Consumer>>;

    async fn create_producer(&self) -> Result<Box<dyn Producer>>;

    /// Ends the connection. Temporary queues are removed by the broker.
    async fn close(&self, graceful: bool);

    /// Token cancelled when the connection ends, for whatever reason.
    fn closed(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.closed().is_cancelled()
    }
}

pub trait Consumer: Send + Sync {
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, destination: &str, message: TransportMessage) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>>;
}
