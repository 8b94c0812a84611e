// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Broker Client
//!
//! Implementation of the broker client capability over an AMQP 0-9-1 broker
//! through lapin. Headers travel as long strings in the AMQP field table.

use crate::{
    client::{
        BrokerChannel, BrokerClient, BrokerConnection, BrokerDelivery, ConsumerDefinition,
        DeliveryStream, Headers, MessageProperties, OutboundMessage, QosOptions,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent on a normal channel/connection close
const REPLY_SUCCESS: u16 = 200;

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Dials AMQP brokers with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinClient;

impl LapinClient {
    pub fn new() -> Self {
        LapinClient
    }
}

#[async_trait]
impl BrokerClient for LapinClient {
    async fn connect(
        &self,
        address: &str,
        connection_name: &str,
    ) -> Result<Box<dyn BrokerConnection>, AmqpError> {
        let mut options = ConnectionProperties::default();
        if !connection_name.is_empty() {
            options = options.with_connection_name(LongString::from(connection_name));
        }

        let conn = Connection::connect(address, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;

        Ok(Box::new(LapinConnection { inner: conn }))
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.inner.create_channel().await {
            Ok(c) => Ok(Arc::new(LapinChannel { inner: c })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, qos: QosOptions) -> Result<(), AmqpError> {
        // lapin always sends prefetch-size 0
        self.inner
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions { global: qos.global },
            )
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let queue = self
            .inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))?;

        Ok(QueueHandle {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn basic_publish(&self, msg: OutboundMessage) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_delivery_mode(msg.properties.delivery_mode)
            .with_headers(to_field_table(&msg.properties.headers));

        if let Some(content_type) = &msg.properties.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }
        if let Some(message_id) = &msg.properties.message_id {
            props = props.with_message_id(ShortString::from(message_id.as_str()));
        }
        if let Some(kind) = &msg.properties.kind {
            props = props.with_type(ShortString::from(kind.as_str()));
        }

        self.inner
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    mandatory: msg.mandatory,
                    immediate: msg.immediate,
                },
                &msg.body,
                props,
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn basic_consume(&self, def: &ConsumerDefinition) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                &def.queue,
                &def.tag,
                BasicConsumeOptions {
                    no_local: def.no_local,
                    no_ack: def.no_ack,
                    exclusive: def.exclusive,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(def.queue.clone(), err.to_string())
            })?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(Box::new(LapinDelivery::new(delivery)) as Box<dyn BrokerDelivery>),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct LapinDelivery {
    inner: Delivery,
    properties: MessageProperties,
}

impl LapinDelivery {
    fn new(inner: Delivery) -> Self {
        let props = &inner.properties;
        let properties = MessageProperties {
            delivery_mode: props.delivery_mode().unwrap_or_default(),
            content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
            message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
            kind: props.kind().as_ref().map(|v| v.as_str().to_owned()),
            headers: props
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default(),
        };

        LapinDelivery { inner, properties }
    }
}

#[async_trait]
impl BrokerDelivery for LapinDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.inner
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        debug!(tag = self.inner.delivery_tag, requeue, "rejecting delivery");
        self.inner
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    FieldTable::from(btree)
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_through_field_table() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), "00-abc-def-01".to_owned());

        let table = to_field_table(&headers);
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn non_string_headers_are_skipped() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("count"), AMQPValue::LongInt(3));
        btree.insert(
            ShortString::from("kind"),
            AMQPValue::ShortString(ShortString::from("x")),
        );

        let headers = from_field_table(&FieldTable::from(btree));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("kind").map(String::as_str), Some("x"));
    }
}
