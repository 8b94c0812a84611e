// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges receive published envelopes and forward them to bound queues.
//! Envelope routing relies on topic exchanges, so `ExchangeDefinition::new`
//! starts from a durable, non-auto-delete topic exchange.

/// Represents the exchange types the access layer can declare.
///
/// - Direct: routes on an exact routing key match
/// - Fanout: copies every message to all bound queues
/// - Topic: routes on `*`/`#` pattern matching of dot-delimited routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Definition of an exchange with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
}

impl ExchangeDefinition {
    /// Creates a durable topic exchange definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange, the first segment of the addresses routed to it
    ///
    /// # Returns
    /// A durable, non-auto-delete topic exchange definition
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            delete: false,
            durable: true,
            internal: false,
            no_wait: false,
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - Topic, direct or fanout
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange to auto-delete when its last binding is removed.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange transient: it does not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets no_wait flag, the broker does not confirm the declaration.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    /// Whether re-declaring `other` over this exchange would be accepted.
    ///
    /// The no-wait flag is a per-call option, not a property of the exchange.
    pub fn is_equivalent(&self, other: &ExchangeDefinition) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.durable == other.durable
            && self.delete == other.delete
            && self.internal == other.internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_durable_topic() {
        let def = ExchangeDefinition::new("orders");
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());
        assert!(!def.is_internal());
    }

    #[test]
    fn equivalence_ignores_no_wait() {
        let def = ExchangeDefinition::new("orders");
        assert!(def.is_equivalent(&def.clone().no_wait()));
        assert!(!def.is_equivalent(&def.clone().transient()));
        assert!(!def.is_equivalent(&def.clone().kind(ExchangeKind::Fanout)));
    }
}
