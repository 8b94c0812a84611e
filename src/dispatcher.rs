// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! Subscribes to a queue with manual acknowledgement and dispatches one handler
//! task per decoded envelope. One intake task drains the delivery stream; it
//! never waits for a handler to finish, so handlers of back-to-back deliveries
//! run concurrently. Invocations start in receipt order, completion order is
//! not guaranteed.
//!
//! Intake is bounded twice: by the channel prefetch (the broker stops handing
//! out deliveries while too many are unsettled) and by `max_in_flight` handler
//! permits. Handler tasks are supervised in a `JoinSet`, so shutting a consumer
//! down stops intake between deliveries and waits for in-flight handlers.

use crate::{
    client::{BrokerChannel, ConsumerDefinition, DeliveryStream},
    configs::AmqpConfigs,
    consumer::{self, AckMode},
    errors::AmqpError,
    handler::EnvelopeHandler,
    queue::QueueHandle,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Starts consumers on the queues of a session channel.
pub struct AmqpDispatcher {
    channel: Arc<dyn BrokerChannel>,
    ack_mode: AckMode,
    max_in_flight: usize,
}

impl AmqpDispatcher {
    pub fn new(channel: Arc<dyn BrokerChannel>, configs: &AmqpConfigs) -> Self {
        AmqpDispatcher {
            channel,
            ack_mode: configs.ack_mode,
            max_in_flight: configs.max_in_flight.max(1),
        }
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Subscribes to `queue` and starts the intake task in the background.
    pub async fn spawn(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        let tag = format!("{}-{}", queue.name, Uuid::new_v4());
        let def = ConsumerDefinition::new(&queue.name).tag(&tag);

        let deliveries = self.channel.basic_consume(&def).await.inspect_err(|err| {
            error!(error = err.to_string(), queue = queue.name, "error to create the consumer");
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let intake = Intake {
            queue: queue.name.clone(),
            handler,
            ack_mode: self.ack_mode,
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
            shutdown: shutdown_rx,
        };

        info!(queue = queue.name, tag, "waiting for messages");
        let task = tokio::spawn(intake.run(deliveries));

        Ok(ConsumerHandle {
            queue: queue.name.clone(),
            shutdown,
            task,
        })
    }

    /// Consumes `queue` until the channel closes.
    pub async fn consume(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), AmqpError> {
        self.spawn(queue, handler).await?.join().await
    }
}

/// Control over a running consumer.
///
/// Dropping the handle leaves the consumer running.
pub struct ConsumerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Asks the intake task to stop before the next delivery.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops intake and waits for in-flight handlers to settle their deliveries.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        self.cancel();
        self.join().await
    }

    /// Waits until the consumer stops.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}

struct Intake {
    queue: String,
    handler: Arc<dyn EnvelopeHandler>,
    ack_mode: AckMode,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Intake {
    async fn run(mut self, mut deliveries: DeliveryStream) {
        let mut tasks = JoinSet::new();

        loop {
            while let Some(res) = tasks.try_join_next() {
                log_join(res);
            }

            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    continue;
                }
                None => {
                    debug!(queue = self.queue, "delivery stream closed");
                    break;
                }
            };

            let Some(envelope) = consumer::decode(delivery.as_ref()).await else {
                continue;
            };

            if self.ack_mode == AckMode::AtMostOnce
                && consumer::ack_on_receipt(delivery.as_ref()).await.is_err()
            {
                continue;
            }

            let handler = self.handler.clone();
            let ack_mode = self.ack_mode;
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = consumer::process(delivery, envelope, handler, ack_mode).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            });
        }

        debug!(queue = self.queue, in_flight = tasks.len(), "draining handlers");
        while let Some(res) = tasks.join_next().await {
            log_join(res);
        }
        info!(queue = self.queue, "consumer stopped");
    }
}

/// Resolves once cancellation is requested. Never resolves when the handle is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(err) = res {
        error!(error = err.to_string(), "handler task failed");
    }
}
