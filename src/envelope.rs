//! The Method object: in-memory envelope representation plus the three
//! envelope factories from the wire protocol (request / response / result).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// `type` discriminant of an envelope.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Command,
    Event,
    Result,
}

/// A single JSON object on the wire — the atomic unit of the protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub identifier: String,
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default = "default_payload")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

fn default_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Sequence numbers live in `[1, 9999]` and wrap back to 1, per §8's
/// sequence-wrap law. 0 is reserved and never produced on the wire.
pub const SEQUENCE_MIN: u32 = 1;
pub const SEQUENCE_MAX: u32 = 9999;

#[derive(Debug, Default)]
pub struct SequenceCounter(u32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns the next sequence number, wrapping `9999 -> 1`.
    pub fn next(&mut self) -> u32 {
        self.0 = if self.0 >= SEQUENCE_MAX {
            SEQUENCE_MIN
        } else {
            self.0 + 1
        };
        self.0
    }
}

impl Envelope {
    /// Parse a raw JSON string into an envelope, validating the required
    /// fields per §4.2. Failure here means the sender's connection must be
    /// closed.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let env: Envelope = serde_json::from_str(raw)?;
        if env.identifier.is_empty() {
            return Err(Error::data("missing identifier"));
        }
        if env.sequence < SEQUENCE_MIN || env.sequence > SEQUENCE_MAX {
            return Err(Error::data("sequence out of range"));
        }
        if !env.payload.is_object() {
            return Err(Error::data("payload must be an object"));
        }
        Ok(env)
    }

    pub fn to_wire_string(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Build an event/command envelope for delivery to a peer.
    pub fn response(
        kind: EnvelopeType,
        source: impl Into<String>,
        destination: Option<String>,
        identifier: impl Into<String>,
        sequence: u32,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            destination,
            source: Some(source.into()),
            identifier: identifier.into(),
            sequence,
            timeout: None,
            payload,
            status: None,
        }
    }

    /// Build a `result` envelope replying to `sequence` with `status` and
    /// an optional payload.
    pub fn result(
        destination: impl Into<String>,
        identifier: impl Into<String>,
        sequence: u32,
        status: i64,
        payload: Value,
    ) -> Self {
        Self {
            kind: EnvelopeType::Result,
            destination: Some(destination.into()),
            source: None,
            identifier: identifier.into(),
            sequence,
            timeout: None,
            payload,
            status: Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_missing_identifier() {
        let raw = r#"{"type":"command","destination":"x","identifier":"","sequence":1,"payload":{}}"#;
        assert!(Envelope::parse(raw).is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_sequence() {
        let raw = r#"{"type":"command","destination":"x","identifier":"a","sequence":0,"payload":{}}"#;
        assert!(Envelope::parse(raw).is_err());
    }

    #[test]
    fn parse_defaults_payload_to_empty_object() {
        let raw = r#"{"type":"event","identifier":"demo","sequence":5}"#;
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.payload, Value::Object(serde_json::Map::new()));
    }

    #[test]
    fn sequence_counter_wraps_at_9999() {
        let mut c = SequenceCounter::new();
        for _ in 0..SEQUENCE_MAX {
            c.next();
        }
        assert_eq!(c.next(), 1);
    }
}
