//! Produce/consume latency protocol.
//!
//! # Purpose
//! Runs one measurement against an acquired connection: open a producer, open
//! an exclusive latest-position consumer, send the batch asynchronously while a
//! receive loop reads it back, and race completion against errors and a global
//! deadline.
//!
//! # Design notes
//! - The consumer is subscribed before the first send; a latest-position
//!   subscription cannot see anything published earlier.
//! - Send instants are recorded in the shared [`PendingTable`] before each send
//!   is issued, so a delivery can never be matched before its send is known.
//! - The receive loop watches a cancel flag shared with the race. Whatever wins,
//!   the flag is raised and the loop stops at its next suspension point
//!   instead of outliving the call by up to one receive timeout.
use bytes::Bytes;
use parking_lot::Mutex;
use pulsemon_broker::{
    BrokerError, Connection, Consumer, Credential, Endpoint, Producer, SendCallback,
    TrustMaterial,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{MeasurementResult, PendingTable, Receipt};
use crate::cache::ConnectionCache;
use crate::error::{ProbeError, ProbeFailure, SessionRole};
use crate::payload::PayloadBatch;
use crate::SUBSCRIPTION_NAME;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PER_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub subscription: String,
    /// Bound on each consumer receive.
    pub receive_timeout: Duration,
    /// Global deadline is this times the batch size.
    pub per_message_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            subscription: SUBSCRIPTION_NAME.to_string(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            per_message_timeout: DEFAULT_PER_MESSAGE_TIMEOUT,
        }
    }
}

impl ProbeConfig {
    pub fn overall_timeout(&self, batch_len: usize) -> Duration {
        let factor = u32::try_from(batch_len).unwrap_or(u32::MAX);
        self.per_message_timeout
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

/// Where and how to connect for one run.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub endpoint: Endpoint,
    pub credential: Credential,
    pub trust: TrustMaterial,
    pub topic: String,
}

pub struct LatencyProbe {
    cache: Arc<ConnectionCache>,
    config: ProbeConfig,
}

impl LatencyProbe {
    pub fn new(cache: Arc<ConnectionCache>, config: ProbeConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Acquire the target's connection from the cache and measure.
    pub async fn run(
        &self,
        target: &ProbeTarget,
        batch: &PayloadBatch,
    ) -> Result<MeasurementResult, ProbeFailure> {
        let connection = match self
            .cache
            .acquire(&target.endpoint, &target.credential, &target.trust)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                warn!(endpoint = %target.endpoint, error = %err, "broker connect failed");
                record_outcome(Err(&err));
                return Err(err.into());
            }
        };
        self.measure(&target.endpoint, connection, &target.topic, batch)
            .await
    }

    pub async fn measure(
        &self,
        endpoint: &Endpoint,
        connection: Arc<dyn Connection>,
        topic: &str,
        batch: &PayloadBatch,
    ) -> Result<MeasurementResult, ProbeFailure> {
        let outcome = self.measure_inner(connection, topic, batch).await;
        if let Err(err) = &outcome
            && err.invalidates_connection()
        {
            self.cache.invalidate(endpoint).await;
        }
        match &outcome {
            Ok(result) => info!(
                endpoint = %endpoint,
                topic,
                messages = batch.len(),
                latency_ms = result.latency.as_millis() as u64,
                in_order = result.in_order,
                "latency measured"
            ),
            Err(err) => warn!(
                endpoint = %endpoint,
                topic,
                messages = batch.len(),
                kind = err.kind(),
                error = %err,
                "latency measure failed"
            ),
        }
        record_outcome(outcome.as_ref().map(|_| ()));
        outcome.map_err(ProbeFailure::from)
    }

    async fn measure_inner(
        &self,
        connection: Arc<dyn Connection>,
        topic: &str,
        batch: &PayloadBatch,
    ) -> Result<MeasurementResult, ProbeError> {
        if batch.is_empty() {
            return Err(ProbeError::EmptyBatch);
        }
        // Content is the matching key; a repeat could never be accounted for.
        if let Some(index) = batch.first_duplicate() {
            return Err(ProbeError::DuplicatePayload { index });
        }

        let producer = connection
            .create_producer(topic)
            .await
            .map_err(|source| ProbeError::Session {
                role: SessionRole::Producer,
                topic: topic.to_string(),
                source,
            })?;

        let consumer = match connection
            .subscribe_exclusive_latest(topic, &self.config.subscription)
            .await
        {
            Ok(consumer) => consumer,
            Err(source) => {
                // The connection is invalidated after the producer is released.
                producer.close();
                return Err(ProbeError::Session {
                    role: SessionRole::Consumer,
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        let outcome = self.exchange(producer.as_ref(), consumer, batch).await;
        producer.close();
        outcome
    }

    async fn exchange(
        &self,
        producer: &dyn Producer,
        consumer: Box<dyn Consumer>,
        batch: &PayloadBatch,
    ) -> Result<MeasurementResult, ProbeError> {
        let pending = Arc::new(Mutex::new(PendingTable::new(batch.prefix(), batch.len())));
        let (complete_tx, complete_rx) = oneshot::channel();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(receive_loop(ReceiveLoop {
            consumer,
            pending: Arc::clone(&pending),
            receive_timeout: self.config.receive_timeout,
            complete: complete_tx,
            errors: error_tx.clone(),
            cancel: cancel_rx,
        }));

        for payload in batch.iter() {
            pending.lock().record_sent(payload.clone(), Instant::now());
            producer.send_async(payload.clone(), send_callback(error_tx.clone()));
        }
        drop(error_tx);

        let deadline = self.config.overall_timeout(batch.len());
        let outcome = tokio::select! {
            // Errors first: a failing receive loop reports before it drops the
            // completion sender.
            biased;
            Some(err) = error_rx.recv() => Err(err),
            result = complete_rx => result.map_err(|_| ProbeError::Receive(BrokerError::Closed)),
            _ = tokio::time::sleep(deadline) => Err(ProbeError::OverallTimeout(deadline)),
        };
        let _ = cancel_tx.send(true);
        outcome
    }
}

fn send_callback(errors: mpsc::UnboundedSender<ProbeError>) -> SendCallback {
    Box::new(move |result| match result {
        Ok(id) => debug!(message_id = id.0, "payload published"),
        Err(err) => {
            warn!(error = %err, "payload publish failed");
            let _ = errors.send(ProbeError::Send(err));
        }
    })
}

fn record_outcome(outcome: Result<(), &ProbeError>) {
    let label = match outcome {
        Ok(()) => "ok",
        Err(err) => err.kind(),
    };
    metrics::counter!("pulsemon_probe_runs_total", "outcome" => label).increment(1);
}

struct ReceiveLoop {
    consumer: Box<dyn Consumer>,
    pending: Arc<Mutex<PendingTable>>,
    receive_timeout: Duration,
    complete: oneshot::Sender<MeasurementResult>,
    errors: mpsc::UnboundedSender<ProbeError>,
    cancel: watch::Receiver<bool>,
}

async fn receive_loop(state: ReceiveLoop) {
    let ReceiveLoop {
        mut consumer,
        pending,
        receive_timeout,
        complete,
        errors,
        mut cancel,
    } = state;

    while !pending.lock().is_complete() {
        let received = tokio::select! {
            // A dropped sender counts as cancelled too.
            _ = cancel.changed() => None,
            received = consumer.receive(receive_timeout) => Some(received),
        };
        let Some(received) = received else {
            debug!("receive loop cancelled");
            consumer.close();
            return;
        };
        let message = match received.map_err(ProbeError::from_receive) {
            Ok(message) => message,
            // An idle bound is not fatal; the global deadline decides.
            Err(ProbeError::ReceiveTimeout(bound)) => {
                debug!(
                    bound_ms = bound.as_millis() as u64,
                    outstanding = pending.lock().outstanding(),
                    "no message within receive bound"
                );
                continue;
            }
            Err(err) => {
                let _ = errors.send(err);
                consumer.close();
                return;
            }
        };
        let received_at = Instant::now();
        let receipt = pending
            .lock()
            .record_received(message.payload(), received_at);
        log_receipt(&receipt, message.payload());
        if let Err(err) = consumer.acknowledge(&message).await {
            warn!(error = %err, "acknowledge failed");
        }
    }

    let result = pending.lock().finish();
    consumer.close();
    let _ = complete.send(result);
}

fn log_receipt(receipt: &Receipt, payload: &Bytes) {
    match receipt {
        Receipt::Matched {
            index,
            latency,
            in_order,
        } => debug!(
            index = ?index,
            payload_size = payload.len(),
            latency_us = latency.as_micros() as u64,
            in_order,
            "probe message received"
        ),
        Receipt::Unknown => debug!(payload_size = payload.len(), "unexpected message received"),
        Receipt::Duplicate => debug!(payload_size = payload.len(), "duplicate message received"),
    }
}
