//! Broker message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, Payload};

/// Longest value AMQP allows in a short-string property such as `reply-to`.
pub const MAX_REPLY_ADDRESS_LEN: usize = 255;

/// A message received from or sent to the broker.
///
/// `correlation_id` and `reply_to` travel as broker-native properties, never
/// inside the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            correlation_id: None,
            reply_to: None,
            timestamp: None,
        }
    }

    /// Build a message whose body is the encoded payload.
    pub fn from_payload(payload: &Payload) -> Self {
        Self::new(codec::encode(payload))
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Decode the body (JSON first, text fallback).
    pub fn payload(&self) -> Payload {
        codec::decode(&self.body)
    }
}

/// A validated reply destination taken from a request's `reply_to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyAddress(String);

/// Why a `reply_to` property could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyAddressError {
    #[error("reply address is blank")]
    Blank,
    #[error("reply address is {0} bytes, limit is {MAX_REPLY_ADDRESS_LEN}")]
    TooLong(usize),
}

impl ReplyAddress {
    pub fn parse(raw: &str) -> Result<Self, ReplyAddressError> {
        if raw.trim().is_empty() {
            return Err(ReplyAddressError::Blank);
        }
        if raw.len() > MAX_REPLY_ADDRESS_LEN {
            return Err(ReplyAddressError::TooLong(raw.len()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
