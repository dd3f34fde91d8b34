//! Per-run latency and ordering bookkeeping.
//!
//! # Purpose
//! Tracks the send instant of every payload in a run, matches deliveries back to
//! them by exact content, and folds the per-message results into one
//! [`MeasurementResult`].
//!
//! # Ordering rule
//! A delivery is in order only if its sequence index is strictly greater than
//! the highest index accepted so far; the running maximum only moves on
//! in-order deliveries. One out-of-order delivery makes the whole run out of
//! order.
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::FAILED_LATENCY;
use crate::payload::parse_index;

/// Aggregate verdict of one probe run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeasurementResult {
    /// Mean latency in whole milliseconds.
    pub latency: Duration,
    pub in_order: bool,
}

impl MeasurementResult {
    pub fn failed() -> Self {
        Self {
            latency: FAILED_LATENCY,
            in_order: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.latency == FAILED_LATENCY
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receipt {
    Matched {
        index: Option<u64>,
        latency: Duration,
        in_order: bool,
    },
    /// Content was never sent in this run.
    Unknown,
    /// Content was already received once; not counted again.
    Duplicate,
}

#[derive(Debug)]
struct PendingMessage {
    sent_at: Instant,
    index: Option<u64>,
    received: Option<(Duration, bool)>,
}

#[derive(Debug)]
pub struct PendingTable {
    prefix: String,
    entries: HashMap<Bytes, PendingMessage>,
    expected: usize,
    outstanding: usize,
    highest_index: Option<u64>,
}

impl PendingTable {
    pub fn new(prefix: &str, expected: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            entries: HashMap::with_capacity(expected),
            expected,
            outstanding: expected,
            highest_index: None,
        }
    }

    /// Record the send instant of `payload`. Call before the payload is handed
    /// to the producer.
    pub fn record_sent(&mut self, payload: Bytes, sent_at: Instant) {
        let index = parse_index(&self.prefix, &payload);
        self.entries.insert(
            payload,
            PendingMessage {
                sent_at,
                index,
                received: None,
            },
        );
    }

    pub fn record_received(&mut self, payload: &[u8], received_at: Instant) -> Receipt {
        let Some(entry) = self.entries.get_mut(payload) else {
            return Receipt::Unknown;
        };
        if entry.received.is_some() {
            return Receipt::Duplicate;
        }
        let latency = received_at.saturating_duration_since(entry.sent_at);
        let in_order = match (entry.index, self.highest_index) {
            (Some(index), Some(highest)) => index > highest,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if in_order {
            self.highest_index = entry.index;
        }
        entry.received = Some((latency, in_order));
        self.outstanding = self.outstanding.saturating_sub(1);
        Receipt::Matched {
            index: entry.index,
            latency,
            in_order,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding == 0
    }

    /// Fold the run: truncated-millisecond total divided by the batch size, and
    /// the conjunction of every in-order flag. Messages never received count
    /// as out of order.
    pub fn finish(&self) -> MeasurementResult {
        if self.expected == 0 {
            return MeasurementResult::failed();
        }
        let mut total = Duration::ZERO;
        let mut in_order = self.entries.len() == self.expected;
        for entry in self.entries.values() {
            match entry.received {
                Some((latency, ordered)) => {
                    total += latency;
                    in_order &= ordered;
                }
                None => in_order = false,
            }
        }
        let mean_ms = total.as_millis() / self.expected as u128;
        MeasurementResult {
            latency: Duration::from_millis(u64::try_from(mean_ms).unwrap_or(u64::MAX)),
            in_order,
        }
    }
}
