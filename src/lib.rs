// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-envelope
//!
//! Message-broker access layer for services exchanging `Envelope`s over a topic
//! broker: open a `Session`, declare the topology with `AmqpTopology`, publish
//! with `AmqpPublisher` and consume with `AmqpDispatcher`.

mod consumer;
mod otel;

pub mod amqp;
pub mod client;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use configs::AmqpConfigs;
pub use connection::Session;
pub use consumer::AckMode;
pub use dispatcher::{AmqpDispatcher, ConsumerHandle};
pub use envelope::{Address, Envelope};
pub use errors::{AmqpError, HandlerError};
pub use handler::EnvelopeHandler;
pub use publisher::{AmqpPublisher, Publisher};
pub use topology::{AmqpTopology, QueueRegistry, Topology};
