// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Turns one broker delivery into one handler invocation and settles the
//! delivery according to the consumer's `AckMode`:
//!
//! - `AtLeastOnce`: the delivery is acknowledged after the handler succeeds.
//!   `HandlerError::Requeue` rejects it back onto the queue, while
//!   `HandlerError::Discard` or a panicking handler rejects it for good. A
//!   crash before settlement gets the message redelivered.
//! - `AtMostOnce`: the delivery is acknowledged as soon as it is decoded,
//!   before the handler runs. Handler failures are only logged.
//!
//! Bodies that do not decode as an envelope are rejected without requeue in
//! both modes.

use crate::{
    client::BrokerDelivery,
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    handler::EnvelopeHandler,
    otel::{self, CONSUMER_TRACER},
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::Deserialize;
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Span name used when an envelope carries no action
const UNNAMED_SPAN: &str = "envelope";

/// When a delivery is acknowledged relative to its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    #[default]
    AtLeastOnce,
    AtMostOnce,
}

/// Decodes the delivery body, rejecting the delivery when it is not an envelope.
pub(crate) async fn decode(delivery: &dyn BrokerDelivery) -> Option<Envelope> {
    match Envelope::from_bytes(delivery.body()) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            error!(
                error = err.to_string(),
                tag = delivery.delivery_tag(),
                "failure to decode envelope, rejecting"
            );
            if let Err(err) = delivery.reject(false).await {
                error!(error = err.to_string(), "error whiling reject msg");
            }
            None
        }
    }
}

/// Settles a delivery before its handler runs, as `AckMode::AtMostOnce` requires.
pub(crate) async fn ack_on_receipt(delivery: &dyn BrokerDelivery) -> Result<(), AmqpError> {
    delivery.ack().await.inspect_err(|err| {
        error!(error = err.to_string(), "error whiling ack msg");
    })
}

/// Runs the handler for one envelope and settles the delivery.
pub(crate) async fn process(
    delivery: Box<dyn BrokerDelivery>,
    envelope: Envelope,
    handler: Arc<dyn EnvelopeHandler>,
    ack_mode: AckMode,
) -> Result<(), AmqpError> {
    let tracer = global::tracer(CONSUMER_TRACER);
    let name = if envelope.action.is_empty() {
        UNNAMED_SPAN.to_owned()
    } else {
        envelope.action.clone()
    };
    let (ctx, mut span) = otel::new_span(&delivery.properties().headers, &tracer, &name);

    debug!(
        action = name,
        sender = envelope.sender,
        tag = delivery.delivery_tag(),
        redelivered = delivery.redelivered(),
        "received envelope"
    );

    let result = match AssertUnwindSafe(handler.exec(&ctx, envelope))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::discard("handler panicked")),
    };

    if let Err(err) = &result {
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }

    match (ack_mode, result) {
        (AckMode::AtMostOnce, Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }
        (AckMode::AtMostOnce, Err(err)) => {
            warn!(error = err.to_string(), "handler failed, message already acked");
            Ok(())
        }
        (AckMode::AtLeastOnce, Ok(())) => {
            debug!("message successfully processed");
            match delivery.ack().await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    Err(err)
                }
            }
        }
        (AckMode::AtLeastOnce, Err(err)) => {
            let requeue = err.should_requeue();
            if requeue {
                warn!(error = err.to_string(), "error whiling handling msg, requeuing for latter");
            } else {
                warn!(error = err.to_string(), "removing message from queue");
            }

            delivery.reject(requeue).await.inspect_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                span.record_error(err);
            })
        }
    }
}
