// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares the exchanges and queues envelopes travel through and binds
//! queues to exchanges under routing keys. Every declaration is idempotent on
//! the broker side; the first failure aborts the rest of the batch and is
//! returned to the caller, who decides whether to retry the whole batch.
//!
//! Declared queues are collected in a `QueueRegistry` that consumers take by
//! reference. Topology setup must finish before publish/consume traffic
//! starts on the same channel.

use crate::{
    client::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Interface for declaring the broker topology.
#[async_trait]
pub trait Topology {
    /// Declares durable topic exchanges with the given names.
    ///
    /// # Parameters
    /// * `names` - Exchange names, declared in order
    ///
    /// # Returns
    /// The first declaration error, if any
    async fn declare_exchanges(&self, names: &[&str]) -> Result<(), AmqpError>;

    /// Declares durable, non-exclusive queues with the given names.
    ///
    /// # Parameters
    /// * `names` - Queue names, declared in order
    ///
    /// # Returns
    /// A registry holding the handle the broker returned for each queue
    async fn declare_queues(&self, names: &[&str]) -> Result<QueueRegistry, AmqpError>;

    /// Binds every queue in `queues` to `exchange` under `routing_key`.
    ///
    /// Call repeatedly to bind a queue under several keys.
    ///
    /// # Parameters
    /// * `queues` - Names of already declared queues
    /// * `exchange` - Name of an already declared exchange
    /// * `routing_key` - Binding pattern, `*` and `#` wildcards allowed on topic exchanges
    async fn bind(
        &self,
        queues: &[&str],
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;
}

/// Lookup from queue name to the declared queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRegistry {
    queues: HashMap<String, QueueHandle>,
}

impl QueueRegistry {
    /// Looks up a declared queue by name.
    pub fn get(&self, name: &str) -> Option<&QueueHandle> {
        self.queues.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueHandle> {
        self.queues.values()
    }

    fn insert(&mut self, handle: QueueHandle) {
        self.queues.insert(handle.name.clone(), handle);
    }
}

/// Topology manager over a session channel.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
}

impl AmqpTopology {
    /// Creates a topology manager declaring through `channel`.
    ///
    /// # Parameters
    /// * `channel` - The session channel, usually `Session::channel()`
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology { channel }
    }

    /// Declares exchanges from explicit definitions.
    ///
    /// Use this instead of `declare_exchanges` for exchanges that are not
    /// durable topic exchanges.
    ///
    /// # Parameters
    /// * `defs` - Exchange definitions, declared in order
    pub async fn declare_exchange_definitions(
        &self,
        defs: &[ExchangeDefinition],
    ) -> Result<(), AmqpError> {
        for exch in defs {
            debug!("creating exchange: {}", exch.name);

            self.channel.exchange_declare(exch).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                )
            })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Declares queues from explicit definitions.
    ///
    /// # Parameters
    /// * `defs` - Queue definitions, declared in order
    ///
    /// # Returns
    /// A registry of the declared queues
    pub async fn declare_queue_definitions(
        &self,
        defs: &[QueueDefinition],
    ) -> Result<QueueRegistry, AmqpError> {
        let mut registry = QueueRegistry::default();

        for def in defs {
            debug!("creating queue: {}", def.name);

            let handle = self.channel.queue_declare(def).await.inspect_err(|err| {
                error!(error = err.to_string(), name = def.name, "error to declare the queue")
            })?;

            debug!("queue: {} was created", def.name);
            registry.insert(handle);
        }

        Ok(registry)
    }

    /// Declares queue bindings.
    pub async fn bind_queues(&self, bindings: &[QueueBinding]) -> Result<(), AmqpError> {
        for binding in bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel.queue_bind(binding).await.inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange")
            })?;
        }

        Ok(())
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_exchanges(&self, names: &[&str]) -> Result<(), AmqpError> {
        let defs: Vec<ExchangeDefinition> =
            names.iter().map(|name| ExchangeDefinition::new(name)).collect();
        self.declare_exchange_definitions(&defs).await
    }

    async fn declare_queues(&self, names: &[&str]) -> Result<QueueRegistry, AmqpError> {
        let defs: Vec<QueueDefinition> =
            names.iter().map(|name| QueueDefinition::new(name)).collect();
        self.declare_queue_definitions(&defs).await
    }

    async fn bind(
        &self,
        queues: &[&str],
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let bindings: Vec<QueueBinding> = queues
            .iter()
            .map(|queue| QueueBinding::new(queue).exchange(exchange).routing_key(routing_key))
            .collect();
        self.bind_queues(&bindings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{BrokerClient, MockBrokerChannel},
        exchange::ExchangeKind,
        memory::MemoryBroker,
    };
    use mockall::Sequence;

    async fn memory_topology(broker: &MemoryBroker) -> AmqpTopology {
        let conn = broker.connect("memory://", "test").await.unwrap();
        AmqpTopology::new(conn.create_channel().await.unwrap())
    }

    #[tokio::test]
    async fn declares_durable_topic_exchanges() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .withf(|def| {
                def.exchange_kind() == ExchangeKind::Topic
                    && def.is_durable()
                    && !def.is_auto_delete()
                    && !def.is_internal()
            })
            .times(2)
            .returning(|_| Ok(()));

        AmqpTopology::new(Arc::new(channel))
            .declare_exchanges(&["orders", "users"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_failure_aborts_the_batch() {
        let mut seq = Sequence::new();
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_declare()
            .withf(|def| def.name() == "a")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| {
                Ok(QueueHandle {
                    name: def.name().to_owned(),
                    message_count: 0,
                    consumer_count: 0,
                })
            });
        channel
            .expect_queue_declare()
            .withf(|def| def.name() == "b")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned(), "x".into())));

        let err = AmqpTopology::new(Arc::new(channel))
            .declare_queues(&["a", "b", "c"])
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::DeclareQueueError(name, _) if name == "b"));
    }

    #[tokio::test]
    async fn registry_holds_declared_queues() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;

        let registry = topology.declare_queues(&["inbound", "outbound"]).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("inbound"));
        assert_eq!(registry.get("outbound").map(QueueHandle::name), Some("outbound"));
        assert!(registry.get("missing").is_none());

        let queue = broker.queue("inbound").unwrap();
        assert!(queue.is_durable() && !queue.is_auto_delete() && !queue.is_exclusive());
    }

    #[tokio::test]
    async fn redeclaring_the_topology_succeeds() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;

        for _ in 0..2 {
            topology.declare_exchanges(&["orders"]).await.unwrap();
            topology.declare_queues(&["q1", "q2"]).await.unwrap();
            topology
                .bind(&["q1", "q2"], "orders", "orders.created")
                .await
                .unwrap();
        }

        assert_eq!(broker.bindings().len(), 2);
    }

    #[tokio::test]
    async fn conflicting_redeclaration_is_an_error() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;
        topology.declare_exchanges(&["orders"]).await.unwrap();

        let direct = ExchangeDefinition::new("orders").kind(ExchangeKind::Direct);
        let err = topology
            .declare_exchange_definitions(&[direct])
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::DeclareExchangeError(..)));
    }

    #[tokio::test]
    async fn explicit_definitions_keep_their_flags() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;

        topology
            .declare_exchange_definitions(&[ExchangeDefinition::new("audit")
                .kind(ExchangeKind::Fanout)
                .delete()
                .internal()
                .no_wait()])
            .await
            .unwrap();
        let registry = topology
            .declare_queue_definitions(&[QueueDefinition::new("scratch")
                .transient()
                .delete()
                .exclusive()
                .no_wait()])
            .await
            .unwrap();
        assert!(registry.contains("scratch"));

        let exchange = broker.exchange("audit").unwrap();
        assert_eq!(exchange.exchange_kind(), ExchangeKind::Fanout);
        assert!(exchange.is_auto_delete() && exchange.is_internal() && exchange.is_no_wait());

        let queue = broker.queue("scratch").unwrap();
        assert!(!queue.is_durable() && queue.is_auto_delete());
        assert!(queue.is_exclusive() && queue.is_no_wait());
    }

    #[tokio::test]
    async fn multiple_bindings_per_queue() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;
        topology.declare_exchanges(&["orders"]).await.unwrap();
        topology.declare_queues(&["audit"]).await.unwrap();

        topology.bind(&["audit"], "orders", "orders.created").await.unwrap();
        topology.bind(&["audit"], "orders", "orders.deleted").await.unwrap();

        let bindings = broker.bindings();
        assert!(bindings
            .iter()
            .all(|b| b.queue_name() == "audit" && b.exchange_name() == "orders"));

        let mut keys: Vec<&str> = bindings.iter().map(QueueBinding::key).collect();
        keys.sort();
        assert_eq!(keys, vec!["orders.created", "orders.deleted"]);
    }

    #[tokio::test]
    async fn binding_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        let topology = memory_topology(&broker).await;
        topology.declare_exchanges(&["orders"]).await.unwrap();

        let err = topology.bind(&["ghost"], "orders", "orders.#").await.unwrap_err();
        assert_eq!(
            err,
            AmqpError::BindingExchangeToQueueError(
                "orders".to_owned(),
                "ghost".to_owned(),
                "NOT_FOUND - no queue 'ghost'".to_owned(),
            )
        );
    }
}
