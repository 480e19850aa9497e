//! Batch payloads: several logical events sealed in one envelope.
//!
//! A batch is the JSON array `[{ "ev": <name>, "data": <any> }, ...]`. Order
//! is significant and preserved end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One logical event inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEvent {
    #[serde(rename = "ev")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl RpcEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Outcome of one dispatched event, returned to the caller encrypted.
///
/// A batch reply is the ordered array of these, one per request entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(rename = "ev")]
    pub name: String,
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn ok(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            result: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Serialize an ordered list of events into a batch plaintext.
pub fn pack(events: &[RpcEvent]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(events)?)
}

/// Parse a batch plaintext, preserving order.
///
/// `max_events` of zero disables the size check.
pub fn unpack(plaintext: &[u8], max_events: usize) -> Result<Vec<RpcEvent>> {
    let events: Vec<RpcEvent> =
        serde_json::from_slice(plaintext).map_err(|e| Error::Batch(e.to_string()))?;
    if max_events > 0 && events.len() > max_events {
        return Err(Error::Batch(format!(
            "{} events exceeds the limit of {max_events}",
            events.len()
        )));
    }
    if let Some(pos) = events.iter().position(|e| e.name.is_empty()) {
        return Err(Error::Batch(format!("event {pos} has an empty name")));
    }
    Ok(events)
}

/// Serialize a single `{ ev, data }` event (the `tp.invoke` plaintext).
pub fn pack_single(event: &RpcEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Parse a single `{ ev, data }` event.
pub fn unpack_single(plaintext: &[u8]) -> Result<RpcEvent> {
    let event: RpcEvent =
        serde_json::from_slice(plaintext).map_err(|e| Error::Batch(e.to_string()))?;
    if event.name.is_empty() {
        return Err(Error::Batch("event has an empty name".into()));
    }
    Ok(event)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pack_unpack_preserves_order() {
        let events = vec![
            RpcEvent::new("a", Value::Null),
            RpcEvent::new("b", json!({ "n": 1 })),
            RpcEvent::new("c", json!([1, 2, 3])),
        ];
        let plaintext = pack(&events).unwrap();
        let unpacked = unpack(&plaintext, 0).unwrap();
        let names: Vec<_> = unpacked.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(unpacked, events);
    }

    #[test]
    fn wire_shape_uses_ev_key() {
        let plaintext = pack(&[RpcEvent::new("ping", json!(1))]).unwrap();
        let value: Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(value, json!([{ "ev": "ping", "data": 1 }]));
    }

    #[test]
    fn data_defaults_to_null() {
        let events = unpack(br#"[{"ev":"a"}]"#, 0).unwrap();
        assert_eq!(events[0].data, Value::Null);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let events: Vec<_> = (0..5).map(|i| RpcEvent::new(format!("e{i}"), Value::Null)).collect();
        let plaintext = pack(&events).unwrap();
        assert!(matches!(unpack(&plaintext, 4), Err(Error::Batch(_))));
        assert_eq!(unpack(&plaintext, 5).unwrap().len(), 5);
    }

    #[test]
    fn malformed_batch_is_rejected() {
        assert!(matches!(unpack(b"{\"ev\":\"a\"}", 0), Err(Error::Batch(_))));
        assert!(matches!(unpack(b"not json", 0), Err(Error::Batch(_))));
        assert!(matches!(unpack(br#"[{"ev":""}]"#, 0), Err(Error::Batch(_))));
    }

    #[test]
    fn reply_omits_absent_fields() {
        let ok = serde_json::to_value(RpcReply::ok("ping", json!("pong"))).unwrap();
        assert_eq!(ok, json!({ "ev": "ping", "result": true, "data": "pong" }));
        let err = serde_json::to_value(RpcReply::err("boom", "nope")).unwrap();
        assert_eq!(err, json!({ "ev": "boom", "result": false, "error": "nope" }));
    }

    #[test]
    fn single_event_roundtrip() {
        let event = RpcEvent::new("ping", json!({ "t": 1 }));
        let plaintext = pack_single(&event).unwrap();
        assert_eq!(unpack_single(&plaintext).unwrap(), event);
        assert!(unpack_single(br#"{"data":1}"#).is_err());
    }
}
