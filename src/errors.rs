// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers every failure the access layer can surface to its caller:
//! session setup, topology declaration, publishing, consuming and configuration.
//! `HandlerError` is what an envelope handler returns to steer acknowledgement.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Variants are grouped the way callers react to them: setup failures are fatal
/// for the session, topology failures abort the current declaration batch, and
/// publish failures are returned to the publisher without any retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// The envelope has neither a receiver nor a target
    #[error("envelope has no destination address")]
    MissingAddress,

    /// The destination address has no exchange segment
    #[error("malformed address `{0}`: expected `<exchange>.<routing-suffix>`")]
    MalformedAddress(String),

    /// Error serializing an envelope or a payload value
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    ConsumerDeclarationError(String, String),

    /// Error receiving a message
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// The channel was closed while an operation was attempted
    #[error("channel closed")]
    ChannelClosed,

    /// An operation did not complete within its deadline
    #[error("`{0}` timed out")]
    Timeout(String),

    /// Error loading configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

/// Outcome of a failed handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed for a transient reason; the delivery goes back to the queue.
    #[error("requeue: {0}")]
    Requeue(String),

    /// Processing can never succeed; the delivery is dropped.
    #[error("discard: {0}")]
    Discard(String),
}

impl HandlerError {
    pub fn requeue(reason: impl Into<String>) -> Self {
        HandlerError::Requeue(reason.into())
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        HandlerError::Discard(reason.into())
    }

    /// Whether the broker should redeliver the message.
    pub fn should_requeue(&self) -> bool {
        matches!(self, HandlerError::Requeue(_))
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
