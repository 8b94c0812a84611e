// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Carries the trace context of a publisher to its consumers through message
//! headers, and opens the consumer span for each delivery.

use crate::client::Headers;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Name of the tracer used for consumer spans
pub const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter exposing message headers to the OpenTelemetry propagators.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Extracts the publisher context from `headers` and starts a consumer span
/// named `name` under it.
pub(crate) fn new_span(
    headers: &Headers,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeadersPropagator::new(&mut headers).set("TraceParent", "v".to_owned());
        assert_eq!(headers.get("traceparent").map(String::as_str), Some("v"));
    }

    #[test]
    fn extractor_reads_headers() {
        let mut headers = Headers::new();
        headers.insert("a".to_owned(), "1".to_owned());
        headers.insert("b".to_owned(), "2".to_owned());

        let propagator = HeadersPropagator::new(&mut headers);
        assert_eq!(propagator.get("a"), Some("1"));
        assert_eq!(propagator.get("c"), None);
        assert_eq!(propagator.keys(), vec!["a", "b"]);
    }
}
