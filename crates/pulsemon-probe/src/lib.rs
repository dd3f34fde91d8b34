//! Synthetic publish/subscribe latency probe.
//!
//! # Purpose
//! Measures end-to-end latency and delivery order against a broker cluster by
//! publishing a batch of uniquely indexed payloads through a fresh producer
//! while an exclusive, latest-position consumer reads them back.
//!
//! # Design notes
//! - [`ConnectionCache`] keeps one connection per endpoint and drops it the
//!   moment a session on it fails, so the next run reconnects.
//! - [`LatencyProbe`] races completion against send/receive errors and a global
//!   deadline; every losing path yields [`FAILED_LATENCY`] through
//!   [`ProbeFailure`].
//! - [`AnomalyDetector`] judges individual measurements against the history of
//!   their series with a 2σ rule.
use std::time::Duration;

pub mod aggregate;
pub mod cache;
pub mod error;
pub mod measure;
pub mod payload;
pub mod stats;

pub use aggregate::{MeasurementResult, PendingTable, Receipt};
pub use cache::ConnectionCache;
pub use error::{ProbeError, ProbeFailure, SessionRole};
pub use measure::{LatencyProbe, ProbeConfig, ProbeTarget};
pub use payload::{PayloadBatch, parse_index};
pub use stats::{AnomalyDetector, StandardDeviation};

/// Budget applied when a cluster does not configure its own.
pub const DEFAULT_LATENCY_BUDGET: Duration = Duration::from_millis(2400);

/// Latency reported for any failed run. Larger than every real budget, so a
/// failure always compares as over budget.
pub const FAILED_LATENCY: Duration = Duration::from_secs(100);

/// Subscription name used for the exclusive probe consumer.
pub const SUBSCRIPTION_NAME: &str = "latency-measure";

pub const DEFAULT_PAYLOAD_PREFIX: &str = "messageid";
