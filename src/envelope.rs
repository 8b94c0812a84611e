// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope
//!
//! The unit of communication exchanged over the broker. An envelope names its
//! originating actor, its destination address and the action it carries, plus a
//! schema-less `data` bag whose contents the caller encodes and decodes itself.
//!
//! Destination addresses follow the `<exchange>.<routing-suffix>` scheme: the
//! first dot-delimited segment names the exchange and the full address is used
//! as the routing key, so topic bindings can match at any depth.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Separator between address segments.
pub const ADDRESS_SEPARATOR: char = '.';

/// Message exchanged between actors through the broker.
///
/// Every field is optional on the wire; missing fields decode to their empty
/// value so that older producers emitting a subset of the fields stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub sender: String,
    pub source: String,
    pub receiver: String,
    pub target: String,
    pub code: String,
    pub action: String,
    #[serde(alias = "connectionType")]
    pub connection_type: String,
    #[serde(alias = "connectionId")]
    pub connection_id: u64,
    pub broadcast: bool,
    /// Producers that never set a payload send `"data": null`.
    #[serde(deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Envelope {
    /// Creates an envelope sent by `sender` with every other field empty.
    pub fn new(sender: &str) -> Envelope {
        Envelope {
            sender: sender.to_owned(),
            ..Envelope::default()
        }
    }

    /// Sets the originating actor when it differs from the sender.
    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_owned();
        self
    }

    /// Sets the destination address, `<exchange>.<routing-suffix>`.
    ///
    /// # Parameters
    /// * `receiver` - The address; the first segment names the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn receiver(mut self, receiver: &str) -> Self {
        self.receiver = receiver.to_owned();
        self
    }

    /// Sets the fallback destination used when `receiver` is empty.
    pub fn target(mut self, target: &str) -> Self {
        self.target = target.to_owned();
        self
    }

    /// Sets the application-level status or classification.
    pub fn code(mut self, code: &str) -> Self {
        self.code = code.to_owned();
        self
    }

    /// Sets the operation requested or reported.
    ///
    /// The action also names the consumer span and the AMQP `type` property.
    pub fn action(mut self, action: &str) -> Self {
        self.action = action.to_owned();
        self
    }

    /// Records the transport session the envelope originated from.
    pub fn connection(mut self, connection_type: &str, connection_id: u64) -> Self {
        self.connection_type = connection_type.to_owned();
        self.connection_id = connection_id;
        self
    }

    /// Marks the envelope as fan-out rather than point-to-point.
    ///
    /// Routing is unchanged; only consumers interpret the flag.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Attaches a credential or session token.
    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_owned());
        self
    }

    /// Replaces the whole payload bag.
    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Serializes `value` and stores it under `key` in the payload bag.
    ///
    /// # Parameters
    /// * `key` - The payload key, replacing any previous value
    /// * `value` - Any serializable value
    ///
    /// # Returns
    /// Self for method chaining, or `SerializePayloadError`
    pub fn with_data<T>(mut self, key: &str, value: T) -> Result<Self, AmqpError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(value)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;
        self.data.insert(key.to_owned(), value);
        Ok(self)
    }

    /// Decodes the payload value stored under `key`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    pub fn data_as<T>(&self, key: &str) -> Result<Option<T>, AmqpError>
    where
        T: DeserializeOwned,
    {
        match self.data.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
        }
    }

    /// The address the envelope must be routed to: `receiver`, or `target`
    /// when the receiver is empty.
    pub fn destination(&self) -> Option<&str> {
        [self.receiver.as_str(), self.target.as_str()]
            .into_iter()
            .find(|addr| !addr.is_empty())
    }

    /// Resolves and validates the destination address.
    pub fn address(&self) -> Result<Address, AmqpError> {
        match self.destination() {
            Some(addr) => Address::parse(addr),
            None => Err(AmqpError::MissingAddress),
        }
    }

    /// Builds a response to this envelope: the original sender becomes the
    /// receiver and the connection identity is carried over so the response can
    /// find its way back to the originating session.
    pub fn reply_to(&self, sender: &str) -> Envelope {
        let receiver = if self.sender.is_empty() {
            self.source.clone()
        } else {
            self.sender.clone()
        };

        Envelope {
            sender: sender.to_owned(),
            source: sender.to_owned(),
            receiver: receiver.clone(),
            target: receiver,
            action: self.action.clone(),
            connection_type: self.connection_type.clone(),
            connection_id: self.connection_id,
            token: self.token.clone(),
            ..Envelope::default()
        }
    }

    /// Wire encoding: UTF-8 JSON, one envelope per message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// Decodes a message body, `ParsePayloadError` when it is not an envelope.
    pub fn from_bytes(body: &[u8]) -> Result<Envelope, AmqpError> {
        serde_json::from_slice(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Map<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A validated `<exchange>.<routing-suffix>` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    raw: String,
    exchange_len: usize,
}

impl Address {
    /// Parses a destination address.
    ///
    /// The address must contain at least one `.` and a non-empty first segment.
    pub fn parse(raw: &str) -> Result<Address, AmqpError> {
        match raw.find(ADDRESS_SEPARATOR) {
            Some(idx) if idx > 0 => Ok(Address {
                raw: raw.to_owned(),
                exchange_len: idx,
            }),
            _ => Err(AmqpError::MalformedAddress(raw.to_owned())),
        }
    }

    /// The exchange the message is published to: the first address segment.
    pub fn exchange(&self) -> &str {
        &self.raw[..self.exchange_len]
    }

    /// The routing key: the full address.
    pub fn routing_key(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
