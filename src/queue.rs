// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declarations and queue-to-exchange bindings. Queues that carry
//! envelopes are durable, non-exclusive and never auto-deleted, which is what
//! `QueueDefinition::new` produces.

/// Definition of a queue with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
}

impl QueueDefinition {
    /// Creates a durable queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A durable, non-exclusive, non-auto-delete queue definition
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            no_wait: false,
        }
    }

    /// Makes the queue transient: it does not survive a broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets no_wait flag, the broker does not confirm the declaration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    /// Whether re-declaring `other` over this queue would be accepted.
    pub fn is_equivalent(&self, other: &QueueDefinition) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.delete == other.delete
            && self.exclusive == other.exclusive
    }
}

/// Binding of a queue to an exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Parameters
    /// * `exchange` - The name of a declared exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key (or topic pattern) for the binding.
    ///
    /// # Parameters
    /// * `key` - The routing key, `*` matching one word and `#` zero or more
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The routing key or topic pattern of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// A declared queue as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    /// Ready messages at declaration time.
    pub message_count: u32,
    /// Consumers at declaration time.
    pub consumer_count: u32,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}
