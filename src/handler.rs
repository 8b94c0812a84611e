// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Handlers
//!
//! A handler receives every envelope decoded from a queue. Its result decides
//! how the delivery is settled (see `crate::consumer::AckMode`).

use crate::{envelope::Envelope, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::future::Future;

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Processes one envelope.
    ///
    /// `ctx` carries the trace context propagated by the publisher.
    async fn exec(&self, ctx: &Context, envelope: Envelope) -> Result<(), HandlerError>;
}

/// Async closures taking the envelope are handlers.
#[async_trait]
impl<F, Fut> EnvelopeHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, envelope: Envelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}
