// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process that implements the broker client
//! capability with the semantics the access layer relies on:
//!
//! - exchange and queue declarations are idempotent, conflicting properties fail
//! - topic exchanges route on `*` (one word) and `#` (zero or more words)
//! - unroutable messages are dropped
//! - each channel holds at most `prefetch_count` unacknowledged deliveries
//! - rejected-with-requeue deliveries and the deliveries still pending on a
//!   closed channel go back to the head of their queue, flagged as redelivered
//!
//! Useful for tests and for running services locally without a broker.

use crate::{
    client::{
        BrokerChannel, BrokerClient, BrokerConnection, BrokerDelivery, ConsumerDefinition,
        DeliveryStream, MessageProperties, OutboundMessage, QosOptions,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    consumers: u32,
}

#[derive(Debug)]
struct Pending {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    prefetch: u16,
    unacked: BTreeMap<u64, Pending>,
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<QueueBinding>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_tag: u64,
}

struct BrokerState {
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wakes every consumer waiting for a queue or prefetch change.
    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Handle on an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        MemoryBroker {
            state: Arc::new(BrokerState {
                inner: Mutex::new(Inner::default()),
                changed,
            }),
        }
    }

    /// Number of ready (not yet delivered) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Number of delivered but unsettled messages across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().bindings.iter().cloned().collect()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        address: &str,
        connection_name: &str,
    ) -> Result<Box<dyn BrokerConnection>, AmqpError> {
        debug!(address, connection_name, "in-process broker connection");
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            open: AtomicBool::new(true),
            channels: Mutex::new(vec![]),
        }))
    }
}

pub struct MemoryConnection {
    state: Arc<BrokerState>,
    open: AtomicBool,
    channels: Mutex<Vec<u64>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = {
            let mut inner = self.state.lock();
            inner.next_channel += 1;
            let id = inner.next_channel;
            inner.channels.insert(
                id,
                ChannelState {
                    open: true,
                    ..ChannelState::default()
                },
            );
            id
        };

        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let ids = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for id in ids {
            close_channel(&self.state, id);
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct MemoryChannel {
    state: Arc<BrokerState>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, inner: &Inner) -> Result<(), AmqpError> {
        match inner.channels.get(&self.id) {
            Some(c) if c.open => Ok(()),
            _ => Err(AmqpError::ChannelClosed),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, qos: QosOptions) -> Result<(), AmqpError> {
        let mut inner = self.state.lock();
        match inner.channels.get_mut(&self.id) {
            Some(c) if c.open => {
                c.prefetch = qos.prefetch_count;
                Ok(())
            }
            _ => Err(AmqpError::QoSDeclarationError("channel is closed".to_owned())),
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut inner = self.state.lock();
        self.ensure_open(&inner)
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))?;

        match inner.exchanges.get(&def.name) {
            Some(existing) if existing.is_equivalent(def) => Ok(()),
            Some(existing) => Err(AmqpError::DeclareExchangeError(
                def.name.clone(),
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange declared as {} durable={}",
                    existing.kind.as_str(),
                    existing.durable
                ),
            )),
            None => {
                inner.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let mut inner = self.state.lock();
        self.ensure_open(&inner)
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))?;

        let queue = inner
            .queues
            .entry(def.name.clone())
            .or_insert_with(|| QueueState {
                def: def.clone(),
                messages: VecDeque::new(),
                consumers: 0,
            });

        if !queue.def.is_equivalent(def) {
            return Err(AmqpError::DeclareQueueError(
                def.name.clone(),
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue declared as durable={}",
                    queue.def.durable
                ),
            ));
        }

        Ok(QueueHandle {
            name: def.name.clone(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers,
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut inner = self.state.lock();
        let fail = |reason: String| {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
                reason,
            )
        };

        self.ensure_open(&inner).map_err(|err| fail(err.to_string()))?;
        if !inner.exchanges.contains_key(&binding.exchange_name) {
            return Err(fail(format!("NOT_FOUND - no exchange '{}'", binding.exchange_name)));
        }
        if !inner.queues.contains_key(&binding.queue_name) {
            return Err(fail(format!("NOT_FOUND - no queue '{}'", binding.queue_name)));
        }

        inner.bindings.insert(binding.clone());
        Ok(())
    }

    async fn basic_publish(&self, msg: OutboundMessage) -> Result<(), AmqpError> {
        {
            let mut inner = self.state.lock();
            self.ensure_open(&inner)
                .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

            let Some(exchange) = inner.exchanges.get(&msg.exchange) else {
                return Err(AmqpError::PublishingError(format!(
                    "NOT_FOUND - no exchange '{}'",
                    msg.exchange
                )));
            };
            let kind = exchange.kind;

            let targets: HashSet<String> = inner
                .bindings
                .iter()
                .filter(|b| b.exchange_name == msg.exchange)
                .filter(|b| routes(kind, &b.routing_key, &msg.routing_key))
                .map(|b| b.queue_name.clone())
                .collect();

            if targets.is_empty() {
                debug!(
                    exchange = msg.exchange,
                    routing_key = msg.routing_key,
                    "unroutable message dropped"
                );
            }

            for name in targets {
                if let Some(queue) = inner.queues.get_mut(&name) {
                    queue.messages.push_back(StoredMessage {
                        properties: msg.properties.clone(),
                        body: msg.body.clone(),
                        redelivered: false,
                    });
                }
            }
        }

        self.state.notify();
        Ok(())
    }

    async fn basic_consume(&self, def: &ConsumerDefinition) -> Result<DeliveryStream, AmqpError> {
        {
            let mut inner = self.state.lock();
            self.ensure_open(&inner).map_err(|err| {
                AmqpError::ConsumerDeclarationError(def.queue.clone(), err.to_string())
            })?;

            match inner.queues.get_mut(&def.queue) {
                Some(queue) => queue.consumers += 1,
                None => {
                    return Err(AmqpError::ConsumerDeclarationError(
                        def.queue.clone(),
                        format!("NOT_FOUND - no queue '{}'", def.queue),
                    ))
                }
            }
        }

        let cursor = ConsumerCursor {
            state: self.state.clone(),
            channel: self.id,
            queue: def.queue.clone(),
            no_ack: def.no_ack,
            changed: self.state.changed.subscribe(),
        };

        Ok(Box::pin(stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok(Box::new(delivery) as Box<dyn BrokerDelivery>), cursor))
        })))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        close_channel(&self.state, self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.ensure_open(&self.state.lock()).is_ok()
    }
}

/// Closes a channel and requeues its unsettled deliveries.
fn close_channel(state: &BrokerState, id: u64) {
    {
        let mut inner = state.lock();
        let Some(channel) = inner.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let pending = std::mem::take(&mut channel.unacked);

        // Oldest delivery ends up at the head of its queue.
        for (_, p) in pending.into_iter().rev() {
            requeue(&mut inner, p);
        }
    }

    state.notify();
}

fn requeue(inner: &mut Inner, pending: Pending) {
    if let Some(queue) = inner.queues.get_mut(&pending.queue) {
        let mut message = pending.message;
        message.redelivered = true;
        queue.messages.push_front(message);
    }
}

struct ConsumerCursor {
    state: Arc<BrokerState>,
    channel: u64,
    queue: String,
    no_ack: bool,
    changed: watch::Receiver<u64>,
}

impl ConsumerCursor {
    /// Waits for the next message this consumer may receive, or `None` once
    /// the channel is closed.
    async fn next_delivery(&mut self) -> Option<MemoryDelivery> {
        loop {
            self.changed.borrow_and_update();

            match self.try_take() {
                Take::Delivery(delivery) => return Some(delivery),
                Take::Closed => return None,
                Take::Wait => {}
            }

            if self.changed.changed().await.is_err() {
                return None;
            }
        }
    }

    fn try_take(&self) -> Take {
        let mut inner = self.state.lock();
        let inner = &mut *inner;

        let prefetch = match inner.channels.get(&self.channel) {
            Some(c) if c.open => c.prefetch,
            _ => return Take::Closed,
        };

        let in_flight = inner
            .channels
            .get(&self.channel)
            .map(|c| c.unacked.len())
            .unwrap_or_default();
        if !self.no_ack && prefetch > 0 && in_flight >= prefetch as usize {
            return Take::Wait;
        }

        let Some(message) = inner
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.messages.pop_front())
        else {
            return Take::Wait;
        };

        inner.next_tag += 1;
        let tag = inner.next_tag;

        if !self.no_ack {
            if let Some(channel) = inner.channels.get_mut(&self.channel) {
                channel.unacked.insert(
                    tag,
                    Pending {
                        queue: self.queue.clone(),
                        message: message.clone(),
                    },
                );
            }
        }

        Take::Delivery(MemoryDelivery {
            state: self.state.clone(),
            channel: self.channel,
            tag,
            message,
        })
    }
}

impl Drop for ConsumerCursor {
    fn drop(&mut self) {
        if let Some(queue) = self.state.lock().queues.get_mut(&self.queue) {
            queue.consumers = queue.consumers.saturating_sub(1);
        }
    }
}

enum Take {
    Delivery(MemoryDelivery),
    Wait,
    Closed,
}

pub struct MemoryDelivery {
    state: Arc<BrokerState>,
    channel: u64,
    tag: u64,
    message: StoredMessage,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<Pending, String> {
        let mut inner = self.state.lock();
        match inner.channels.get_mut(&self.channel) {
            Some(c) if c.open => c
                .unacked
                .remove(&self.tag)
                .ok_or_else(|| format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag)),
            _ => Err(AmqpError::ChannelClosed.to_string()),
        }
    }
}

#[async_trait]
impl BrokerDelivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn properties(&self) -> &MessageProperties {
        &self.message.properties
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle().map_err(AmqpError::AckMessageError)?;
        self.state.notify();
        Ok(())
    }

    async fn reject(&self, requeue_it: bool) -> Result<(), AmqpError> {
        let pending = self.settle().map_err(AmqpError::RejectMessageError)?;
        if requeue_it {
            requeue(&mut self.state.lock(), pending);
        }
        self.state.notify();
        Ok(())
    }
}

/// Whether a message published with `routing_key` reaches a binding with
/// `pattern` on an exchange of the given kind.
fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key)
                || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DELIVERY_MODE_PERSISTENT;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect("memory://", "test").await.unwrap();
        conn.create_channel().await.unwrap()
    }

    fn message(exchange: &str, key: &str, body: &[u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: key.to_owned(),
            mandatory: false,
            immediate: false,
            properties: MessageProperties {
                delivery_mode: DELIVERY_MODE_PERSISTENT,
                ..MessageProperties::default()
            },
            body: body.to_vec(),
        }
    }

    async fn setup(broker: &MemoryBroker, pattern: &str) -> Arc<dyn BrokerChannel> {
        let ch = channel(broker).await;
        ch.exchange_declare(&ExchangeDefinition::new("orders")).await.unwrap();
        ch.queue_declare(&QueueDefinition::new("q")).await.unwrap();
        ch.queue_bind(&QueueBinding::new("q").exchange("orders").routing_key(pattern))
            .await
            .unwrap();
        ch
    }

    #[test]
    fn topic_patterns() {
        let cases = [
            ("orders.created", "orders.created", true),
            ("orders.*", "orders.created", true),
            ("orders.*", "orders.eu.created", false),
            ("orders.#", "orders.eu.created", true),
            ("orders.#", "orders", true),
            ("#", "anything.at.all", true),
            ("*.created", "orders.created", true),
            ("orders.created", "orders.updated", false),
            ("orders.#.created", "orders.created", true),
            ("orders.#.created", "orders.a.b.created", true),
        ];

        for (pattern, key, expected) in cases {
            assert_eq!(routes(ExchangeKind::Topic, pattern, key), expected, "{pattern} ~ {key}");
        }
    }

    #[test]
    fn direct_and_fanout_routing() {
        assert!(routes(ExchangeKind::Direct, "a.b", "a.b"));
        assert!(!routes(ExchangeKind::Direct, "a.*", "a.b"));
        assert!(routes(ExchangeKind::Fanout, "", "whatever"));
    }

    #[tokio::test]
    async fn redeclaring_is_idempotent() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.created").await;

        ch.exchange_declare(&ExchangeDefinition::new("orders")).await.unwrap();
        ch.queue_declare(&QueueDefinition::new("q")).await.unwrap();
        ch.queue_bind(&QueueBinding::new("q").exchange("orders").routing_key("orders.created"))
            .await
            .unwrap();

        assert_eq!(broker.bindings().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_declarations_fail() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.created").await;

        let err = ch
            .exchange_declare(&ExchangeDefinition::new("orders").transient())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::DeclareExchangeError(name, _) if name == "orders"));

        let err = ch
            .queue_declare(&QueueDefinition::new("q").transient())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::DeclareQueueError(name, _) if name == "q"));
    }

    #[tokio::test]
    async fn binding_requires_existing_entities() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare(&QueueDefinition::new("q")).await.unwrap();

        let err = ch
            .queue_bind(&QueueBinding::new("q").exchange("missing").routing_key("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::BindingExchangeToQueueError(..)));
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.created").await;

        ch.basic_publish(message("orders", "orders.deleted", b"x")).await.unwrap();
        assert_eq!(broker.queue_len("q"), Some(0));

        let err = ch
            .basic_publish(message("nope", "nope.x", b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::PublishingError(_)));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.#").await;
        ch.basic_qos(QosOptions::prefetch(1)).await.unwrap();

        ch.basic_publish(message("orders", "orders.a", b"1")).await.unwrap();
        ch.basic_publish(message("orders", "orders.b", b"2")).await.unwrap();

        let mut deliveries = ch.basic_consume(&ConsumerDefinition::new("q")).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body(), b"1");

        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err());
        assert_eq!(broker.queue_len("q"), Some(1));

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body(), b"2");
        assert!(first.ack().await.is_err());
    }

    #[tokio::test]
    async fn rejected_with_requeue_is_redelivered_first() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.#").await;

        ch.basic_publish(message("orders", "orders.a", b"1")).await.unwrap();
        ch.basic_publish(message("orders", "orders.b", b"2")).await.unwrap();

        let mut deliveries = ch.basic_consume(&ConsumerDefinition::new("q")).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        first.reject(true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.body(), b"1");
        assert!(again.redelivered());

        again.reject(false).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("q"), Some(1));
    }

    #[tokio::test]
    async fn closing_channel_ends_stream_and_requeues() {
        let broker = MemoryBroker::new();
        let ch = setup(&broker, "orders.#").await;
        ch.basic_publish(message("orders", "orders.a", b"1")).await.unwrap();

        let mut deliveries = ch.basic_consume(&ConsumerDefinition::new("q")).await.unwrap();
        let _held = deliveries.next().await.unwrap().unwrap();

        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert!(!ch.is_open());
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_len("q"), Some(1));
    }
}
