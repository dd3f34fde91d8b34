// Probe error taxonomy and the sentinel-carrying failure type.
use pulsemon_broker::BrokerError;
use std::fmt;
use std::time::Duration;

use crate::aggregate::MeasurementResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Producer,
    Consumer,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Producer => f.write_str("producer"),
            SessionRole::Consumer => f.write_str("consumer"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connect to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        source: BrokerError,
    },
    #[error("create {role} on topic {topic} failed: {source}")]
    Session {
        role: SessionRole,
        topic: String,
        source: BrokerError,
    },
    #[error("publish failed: {0}")]
    Send(#[source] BrokerError),
    #[error("consumer receive failed: {0}")]
    Receive(#[source] BrokerError),
    #[error("no message received within {0:?}")]
    ReceiveTimeout(Duration),
    #[error("latency measure not received after {0:?}")]
    OverallTimeout(Duration),
    #[error("payload batch is empty")]
    EmptyBatch,
    #[error("payload {index} repeats an earlier payload in the batch")]
    DuplicatePayload { index: usize },
}

impl ProbeError {
    /// Classify a failed bounded receive.
    pub fn from_receive(err: BrokerError) -> Self {
        match err {
            BrokerError::Timeout(bound) => ProbeError::ReceiveTimeout(bound),
            other => ProbeError::Receive(other),
        }
    }

    /// Short stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Connection { .. } => "connection",
            ProbeError::Session { .. } => "session",
            ProbeError::Send(_) => "send",
            ProbeError::Receive(_) => "receive",
            ProbeError::ReceiveTimeout(_) => "receive_timeout",
            ProbeError::OverallTimeout(_) => "overall_timeout",
            ProbeError::EmptyBatch => "empty_batch",
            ProbeError::DuplicatePayload { .. } => "duplicate_payload",
        }
    }

    /// Connection and session failures leave the cached connection unusable.
    pub fn invalidates_connection(&self) -> bool {
        matches!(
            self,
            ProbeError::Connection { .. } | ProbeError::Session { .. }
        )
    }
}

/// A failed run: the error plus the sentinel result that stands in for it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{source}")]
pub struct ProbeFailure {
    pub result: MeasurementResult,
    #[source]
    pub source: ProbeError,
}

impl ProbeFailure {
    pub fn latency(&self) -> Duration {
        self.result.latency
    }

    pub fn error(&self) -> &ProbeError {
        &self.source
    }
}

impl From<ProbeError> for ProbeFailure {
    fn from(source: ProbeError) -> Self {
        Self {
            result: MeasurementResult::failed(),
            source,
        }
    }
}
