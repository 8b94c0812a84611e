// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Capability
//!
//! The raw primitive set the access layer is built on: connect, open a channel,
//! set QoS, declare exchanges and queues, bind, publish and consume deliveries
//! that can be acknowledged or rejected.
//!
//! `crate::amqp` implements these traits over lapin and `crate::memory`
//! implements them in-process. Everything above this module only talks to the
//! traits.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::{collections::BTreeMap, pin::Pin, sync::Arc};

/// Delivery mode of a message that survives a broker restart once queued
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// String headers carried alongside a message body.
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries produced by a consumer registration.
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<Box<dyn BrokerDelivery>, AmqpError>> + Send>>;

/// Basic properties of a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: u8,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: Headers,
}

/// A message ready to be handed to `basic_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Quality of service applied to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosOptions {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

impl QosOptions {
    /// Per-consumer prefetch limit with no size limit.
    pub fn prefetch(count: u16) -> Self {
        QosOptions {
            prefetch_count: count,
            prefetch_size: 0,
            global: false,
        }
    }
}

/// Consumer registration on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
}

impl ConsumerDefinition {
    /// Manual-ack consumer on `queue` with a broker-generated tag.
    pub fn new(queue: &str) -> Self {
        ConsumerDefinition {
            queue: queue.to_owned(),
            tag: String::new(),
            no_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
        }
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }
}

/// Entry point of a broker client: dials the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        connection_name: &str,
    ) -> Result<Box<dyn BrokerConnection>, AmqpError>;
}

/// An established transport connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;
}

/// A channel multiplexed over a connection.
///
/// Implementations must accept concurrent `basic_publish` calls from several
/// tasks. Declarations are expected to complete before steady-state traffic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, qos: QosOptions) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_publish(&self, msg: OutboundMessage) -> Result<(), AmqpError>;

    async fn basic_consume(&self, def: &ConsumerDefinition) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// One message instance received by a consumer.
#[async_trait]
pub trait BrokerDelivery: Send + Sync {
    fn body(&self) -> &[u8];

    fn properties(&self) -> &MessageProperties;

    fn delivery_tag(&self) -> u64;

    fn redelivered(&self) -> bool;

    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}
