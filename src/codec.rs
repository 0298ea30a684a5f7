//! Message body codec.
//!
//! The same queues carry structured payloads and plain diagnostic text, so
//! decoding tries JSON first and falls back to text. Neither direction can
//! fail.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    /// Convert a typed value into a JSON payload.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Read a typed value out of the payload. Text payloads are treated as a
    /// JSON string.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match self {
            Payload::Json(v) => T::deserialize(v)?,
            Payload::Text(s) => T::deserialize(serde_json::Value::String(s.clone()))?,
        };
        Ok(value)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Json(_) => None,
        }
    }

    /// Collapse into a JSON value; text becomes a JSON string.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Payload::Json(v) => v,
            Payload::Text(s) => serde_json::Value::String(s),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Json(v) => write!(f, "{v}"),
            Payload::Text(s) => f.write_str(s),
        }
    }
}

/// Encode a payload into a message body.
///
/// Text is written as a JSON string, so a reply of `"1.0"` stays text on the
/// other side instead of turning into a number.
pub fn encode(payload: &Payload) -> Vec<u8> {
    let encoded = match payload {
        Payload::Json(value) => serde_json::to_vec(value),
        Payload::Text(text) => serde_json::to_vec(text),
    };
    match encoded {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "json encode failed, falling back to text");
            payload.to_string().into_bytes()
        }
    }
}

/// Decode a message body.
///
/// A top-level JSON string comes back as text, as does any body that is not
/// JSON at all (lossy UTF-8).
pub fn decode(body: &[u8]) -> Payload {
    match serde_json::from_slice(body) {
        Ok(serde_json::Value::String(text)) => Payload::Text(text),
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Text(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_body_decodes_as_empty_text() {
        assert_eq!(decode(b""), Payload::Text(String::new()));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let decoded = decode(&[0x66, 0x6f, 0xff, 0x6f]);
        assert_eq!(decoded, Payload::Text("fo\u{fffd}o".to_string()));
    }

    #[test]
    fn text_that_looks_like_json_stays_text() {
        for text in ["42", "1.0", "true", "null", "[1]", "{\"n\": 1}"] {
            let payload = Payload::from(text);
            assert_eq!(decode(&encode(&payload)), payload, "text {text:?}");
        }
    }

    #[test]
    fn bare_json_body_decodes_structured() {
        assert_eq!(decode(b"42"), Payload::Json(json!(42)));
        assert_eq!(decode(br#"{"n":1}"#), Payload::Json(json!({"n": 1})));
    }

    #[test]
    fn json_string_body_decodes_as_text() {
        assert_eq!(decode(br#""ping""#), Payload::Text("ping".to_string()));
    }

    #[test]
    fn typed_roundtrip_through_payload() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Ping {
            n: u32,
        }

        let payload = Payload::from_serialize(&Ping { n: 7 }).unwrap();
        assert_eq!(payload, Payload::Json(json!({"n": 7})));
        assert_eq!(payload.deserialize::<Ping>().unwrap(), Ping { n: 7 });
    }

    #[test]
    fn text_payload_deserializes_as_string() {
        let payload = Payload::from("hello");
        assert_eq!(payload.deserialize::<String>().unwrap(), "hello");
    }
}
