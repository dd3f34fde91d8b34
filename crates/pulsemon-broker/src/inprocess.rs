//! In-process loopback broker.
//!
//! # Purpose
//! Implements the capability traits entirely in memory so probe runs can be
//! exercised without a cluster. A [`FaultPlan`] injects the failures the probe
//! has to survive: refused connects, broken sessions, failed sends or receives,
//! lost messages, slow delivery and reordering.
//!
//! # Design notes
//! Each topic keeps a registry of live subscribers fed by unbounded queues.
//! Publishing fans out under the topic lock, so sends issued from one thread are
//! delivered in call order unless the fault plan asks otherwise. Delivery delay
//! is applied on the consumer side against `tokio::time`, which keeps latencies
//! exact under a paused test clock.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    BrokerError, Connection, Connector, Consumer, Credential, Endpoint, Message, MessageId,
    Producer, Result, SendCallback, TrustMaterial,
};

/// Failures and delivery distortions applied by the loopback broker.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_connect: bool,
    pub fail_producer: bool,
    pub fail_subscribe: bool,
    pub fail_send: bool,
    pub fail_receive: bool,
    /// Per-topic publish sequence numbers (0-based) that are acknowledged to the
    /// producer but never delivered.
    pub drop_sequences: HashSet<u64>,
    /// Added between publish and the earliest moment a consumer may see the message.
    pub delivery_delay: Duration,
    /// Hold messages until this many are buffered, then deliver them newest
    /// first. Values below 2 disable reordering. A partial window is released,
    /// also newest first, once a consumer's receive would otherwise time out.
    pub reverse_window: usize,
}

/// URL scheme of endpoints the loopback broker stands in for.
pub const LOOPBACK_SCHEME: &str = "loopback";

/// True for `loopback://...` endpoints.
pub fn is_loopback(endpoint: &Endpoint) -> bool {
    endpoint
        .as_str()
        .trim()
        .strip_prefix(LOOPBACK_SCHEME)
        .is_some_and(|rest| rest.starts_with("://"))
}

#[derive(Clone, Debug)]
struct Delivery {
    message: Message,
    deliver_at: Instant,
}

struct SubscriberEntry {
    subscription: String,
    // First sequence this subscriber may observe ("latest" position).
    start_seq: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct TopicState {
    next_seq: u64,
    subscribers: Vec<SubscriberEntry>,
    held: Vec<Delivery>,
}

impl TopicState {
    fn prune(&mut self) {
        self.subscribers.retain(|entry| !entry.sender.is_closed());
    }

    fn release_held(&mut self) -> usize {
        let held = std::mem::take(&mut self.held);
        let released = held.len();
        for delivery in held.into_iter().rev() {
            self.fan_out(delivery);
        }
        released
    }

    fn fan_out(&mut self, delivery: Delivery) {
        self.prune();
        let seq = delivery.message.id().0;
        for entry in self.subscribers.iter().filter(|entry| seq >= entry.start_seq) {
            let _ = entry.sender.send(delivery.clone());
        }
    }
}

/// Shared loopback broker. Clone the `Arc` to hand it to several connectors.
#[derive(Default)]
pub struct InProcessBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    faults: Mutex<FaultPlan>,
    connects: AtomicUsize,
    acked: AtomicUsize,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let broker = Self::new();
        broker.set_faults(faults);
        broker
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *self.faults.lock() = faults;
    }

    pub fn update_faults(&self, update: impl FnOnce(&mut FaultPlan)) {
        update(&mut self.faults.lock());
    }

    /// Number of connect attempts seen, successful or not.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.topics.lock();
        match topics.get_mut(topic) {
            Some(state) => {
                state.prune();
                state.subscribers.len()
            }
            None => 0,
        }
    }

    fn faults(&self) -> FaultPlan {
        self.faults.lock().clone()
    }

    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.prune();
        if state
            .subscribers
            .iter()
            .any(|entry| entry.subscription == subscription)
        {
            return Err(BrokerError::Exclusive {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            });
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(SubscriberEntry {
            subscription: subscription.to_string(),
            start_seq: state.next_seq,
            sender,
        });
        tracing::debug!(topic, subscription, "in-process subscriber registered");
        Ok(receiver)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId> {
        let faults = self.faults();
        if faults.fail_send {
            return Err(BrokerError::Send("injected send failure".to_string()));
        }
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = MessageId(seq);
        if faults.drop_sequences.contains(&seq) {
            tracing::trace!(topic, seq, "in-process broker dropped message");
            return Ok(id);
        }
        let delivery = Delivery {
            message: Message::new(id, payload),
            deliver_at: Instant::now() + faults.delivery_delay,
        };
        if faults.reverse_window > 1 {
            state.held.push(delivery);
            if state.held.len() >= faults.reverse_window {
                state.release_held();
            }
        } else {
            state.fan_out(delivery);
        }
        Ok(id)
    }

    fn flush_held(&self, topic: &str) {
        let mut topics = self.topics.lock();
        if let Some(state) = topics.get_mut(topic) {
            let released = state.release_held();
            if released > 0 {
                tracing::trace!(topic, released, "in-process broker released partial window");
            }
        }
    }
}

/// Connector that resolves every endpoint to the same loopback broker.
#[derive(Clone)]
pub struct InProcessConnector {
    broker: Arc<InProcessBroker>,
}

impl InProcessConnector {
    pub fn new(broker: Arc<InProcessBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InProcessBroker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credential: &Credential,
        _trust: &TrustMaterial,
    ) -> Result<Arc<dyn Connection>> {
        self.broker.connects.fetch_add(1, Ordering::Relaxed);
        if self.broker.faults().fail_connect {
            return Err(BrokerError::Connect {
                endpoint: endpoint.to_string(),
                reason: "injected connect failure".to_string(),
            });
        }
        Ok(Arc::new(InProcessConnection {
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InProcessConnection {
    broker: Arc<InProcessBroker>,
    closed: AtomicBool,
}

impl InProcessConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for InProcessConnection {
    async fn create_producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        self.ensure_open()?;
        if self.broker.faults().fail_producer {
            return Err(BrokerError::Session {
                topic: topic.to_string(),
                reason: "injected producer failure".to_string(),
            });
        }
        Ok(Box::new(InProcessProducer {
            topic: topic.to_string(),
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe_exclusive_latest(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn Consumer>> {
        self.ensure_open()?;
        if self.broker.faults().fail_subscribe {
            return Err(BrokerError::Session {
                topic: topic.to_string(),
                reason: "injected subscribe failure".to_string(),
            });
        }
        let receiver = self.broker.subscribe(topic, subscription)?;
        Ok(Box::new(InProcessConsumer {
            topic: topic.to_string(),
            receiver,
            head: None,
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct InProcessProducer {
    topic: String,
    broker: Arc<InProcessBroker>,
    closed: AtomicBool,
}

impl Producer for InProcessProducer {
    fn send_async(&self, payload: Bytes, on_complete: SendCallback) {
        if self.closed.load(Ordering::Acquire) {
            on_complete(Err(BrokerError::Closed));
            return;
        }
        on_complete(self.broker.publish(&self.topic, payload));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct InProcessConsumer {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    // Dequeued but not yet due; kept across receive calls so a timeout never
    // loses a message.
    head: Option<Delivery>,
    broker: Arc<InProcessBroker>,
}

#[async_trait]
impl Consumer for InProcessConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Message> {
        if self.broker.faults().fail_receive {
            return Err(BrokerError::Receive("injected receive failure".to_string()));
        }
        let deadline = Instant::now() + timeout;
        let delivery = match self.head.take() {
            Some(delivery) => delivery,
            None => match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return Err(BrokerError::Closed),
                Err(_) => {
                    self.broker.flush_held(&self.topic);
                    match self.receiver.try_recv() {
                        Ok(delivery) => delivery,
                        Err(_) => return Err(BrokerError::Timeout(timeout)),
                    }
                }
            },
        };
        if delivery.deliver_at > deadline {
            self.head = Some(delivery);
            tokio::time::sleep_until(deadline).await;
            return Err(BrokerError::Timeout(timeout));
        }
        tokio::time::sleep_until(delivery.deliver_at).await;
        Ok(delivery.message)
    }

    async fn acknowledge(&mut self, _message: &Message) -> Result<()> {
        self.broker.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        self.receiver.close();
    }
}
