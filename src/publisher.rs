// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Publisher
//!
//! Routes outbound envelopes to the exchange named by the first segment of
//! their destination address, using the full address as routing key.
//!
//! Messages are published persistent, as JSON, with `mandatory` and
//! `immediate` unset: the broker silently drops unroutable messages, so a
//! successful publish only means the broker accepted the request.

use crate::{
    client::{BrokerChannel, Headers, MessageProperties, OutboundMessage, DELIVERY_MODE_PERSISTENT},
    configs::AmqpConfigs,
    envelope::Envelope,
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Interface for sending envelopes to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` under the current trace context.
    ///
    /// # Parameters
    /// * `envelope` - The envelope to send; its `receiver` (or `target`) is the destination
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message, which does not mean it was routed
    async fn publish(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        self.publish_with_context(&Context::current(), envelope).await
    }

    /// Publishes `envelope`, propagating `ctx` in the message headers.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `envelope` - The envelope to send
    async fn publish_with_context(
        &self,
        ctx: &Context,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;
}

/// Publisher over a session channel.
///
/// The channel accepts concurrent publishes, so one publisher can be shared
/// between tasks.
pub struct AmqpPublisher {
    channel: Arc<dyn BrokerChannel>,
    timeout: Duration,
}

impl AmqpPublisher {
    /// Creates a publisher over `channel`.
    ///
    /// # Parameters
    /// * `channel` - The session channel
    /// * `configs` - Settings providing the publish timeout
    ///
    /// # Returns
    /// A shareable publisher
    pub fn new(channel: Arc<dyn BrokerChannel>, configs: &AmqpConfigs) -> Arc<AmqpPublisher> {
        Arc::new(AmqpPublisher {
            channel,
            timeout: configs.publish_timeout(),
        })
    }

    /// Builds the broker message for `envelope`.
    ///
    /// Address and serialization errors surface here, before any broker call.
    fn outbound(&self, ctx: &Context, envelope: &Envelope) -> Result<OutboundMessage, AmqpError> {
        let address = envelope.address()?;
        let body = envelope.to_bytes()?;

        let mut headers = Headers::new();
        otel::inject(ctx, &mut headers);

        Ok(OutboundMessage {
            exchange: address.exchange().to_owned(),
            routing_key: address.routing_key().to_owned(),
            mandatory: false,
            immediate: false,
            properties: MessageProperties {
                delivery_mode: DELIVERY_MODE_PERSISTENT,
                content_type: Some(JSON_CONTENT_TYPE.to_owned()),
                message_id: Some(Uuid::new_v4().to_string()),
                kind: (!envelope.action.is_empty()).then(|| envelope.action.clone()),
                headers,
            },
            body,
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish_with_context(
        &self,
        ctx: &Context,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let msg = self.outbound(ctx, envelope).inspect_err(|err| {
            error!(error = err.to_string(), "envelope not published");
        })?;

        let exchange = msg.exchange.clone();
        let routing_key = msg.routing_key.clone();

        match tokio::time::timeout(self.timeout, self.channel.basic_publish(msg)).await {
            Ok(Ok(())) => {
                debug!(exchange, routing_key, action = envelope.action, "message published");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(err)
            }
            Err(_) => {
                error!(exchange, routing_key, "publishing timed out");
                Err(AmqpError::Timeout("publish".to_owned()))
            }
        }
    }
}
