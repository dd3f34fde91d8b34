// Broker capability interface consumed by the latency probe.
//
// The probe never speaks a broker wire protocol itself. Anything that can
// connect, produce, subscribe exclusively at the latest position, receive with a
// bound, and acknowledge can be measured. The in-process loopback broker in
// `inprocess` implements the interface for tests and self-test runs.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod inprocess;

pub use inprocess::{FaultPlan, InProcessBroker, InProcessConnector, LOOPBACK_SCHEME, is_loopback};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Completion callback for an asynchronous send.
///
/// Invoked exactly once, possibly on another thread, with the broker-assigned
/// message id or the reason the publish failed.
pub type SendCallback = Box<dyn FnOnce(Result<MessageId>) + Send + 'static>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("session on topic {topic} failed: {reason}")]
    Session { topic: String, reason: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("no message within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("subscription {subscription} on topic {topic} already has an exclusive consumer")]
    Exclusive { topic: String, subscription: String },
}

/// Unique address of one broker cluster, e.g. `pulsar+ssl://host:6651`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Auth token presented on connect. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Trusted CA bundle used to verify the broker's TLS certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustMaterial {
    ca_bundle: Option<PathBuf>,
}

impl TrustMaterial {
    pub fn ca_bundle(path: impl Into<PathBuf>) -> Self {
        Self {
            ca_bundle: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.ca_bundle.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

/// A message handed out by a consumer.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        trust: &TrustMaterial,
    ) -> Result<Arc<dyn Connection>>;
}

/// A live client connection to one endpoint. Sessions are cheap and short-lived;
/// the connection outlives them.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_producer(&self, topic: &str) -> Result<Box<dyn Producer>>;

    /// Subscribe as the only consumer of `subscription`, starting after the
    /// newest message already on `topic`.
    async fn subscribe_exclusive_latest(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn Consumer>>;

    async fn close(&self);
}

pub trait Producer: Send + Sync {
    /// Queue `payload` for publishing. Sends issued from one thread are
    /// published in call order.
    fn send_async(&self, payload: Bytes, on_complete: SendCallback);

    fn close(&self);
}

#[async_trait]
pub trait Consumer: Send {
    /// Wait at most `timeout` for the next message. Expiry is reported as
    /// [`BrokerError::Timeout`].
    async fn receive(&mut self, timeout: Duration) -> Result<Message>;

    async fn acknowledge(&mut self, message: &Message) -> Result<()>;

    fn close(&mut self);
}
