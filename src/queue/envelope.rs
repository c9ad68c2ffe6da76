//! Wire envelopes for the work queue
//!
//! Every payload crossing the broker is a JSON object of the form
//! `{"version": 1, "kind": "task", "body": {...}}`. Fields are named, and
//! unknown fields are rejected, so producer/consumer drift shows up as an
//! error instead of silently misaligned data.

use crate::model::{Task, TaskResult};
use crate::queue::{QueueError, QueueResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bumped whenever the body layout of any kind changes incompatibly
pub const ENVELOPE_VERSION: u32 = 1;

/// A payload type that can travel in an envelope
pub trait EnvelopeKind: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

impl EnvelopeKind for Task {
    const KIND: &'static str = "task";
}

impl EnvelopeKind for TaskResult {
    const KIND: &'static str = "result";
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T> {
    version: u32,
    kind: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IncomingEnvelope {
    version: u32,
    kind: String,
    body: serde_json::Value,
}

/// Serializes a payload into an envelope string
pub fn encode<T: EnvelopeKind>(body: &T) -> QueueResult<String> {
    let envelope = OutgoingEnvelope {
        version: ENVELOPE_VERSION,
        kind: T::KIND,
        body,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parses an envelope string, checking version and kind before decoding the body
pub fn decode<T: EnvelopeKind>(raw: &str) -> QueueResult<T> {
    let envelope: IncomingEnvelope = serde_json::from_str(raw)?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(QueueError::SchemaMismatch(format!(
            "envelope version {} (expected {})",
            envelope.version, ENVELOPE_VERSION
        )));
    }

    if envelope.kind != T::KIND {
        return Err(QueueError::SchemaMismatch(format!(
            "envelope kind '{}' (expected '{}')",
            envelope.kind,
            T::KIND
        )));
    }

    serde_json::from_value(envelope.body)
        .map_err(|e| QueueError::SchemaMismatch(format!("{} body: {}", T::KIND, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use serde_json::json;

    fn task() -> Task {
        Task {
            id: 3,
            page_number: 12,
            in_work: true,
            completed: false,
        }
    }

    #[test]
    fn test_task_envelope_shape() {
        let raw = encode(&task()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["version"], json!(ENVELOPE_VERSION));
        assert_eq!(value["kind"], json!("task"));
        assert_eq!(value["body"]["page_number"], json!(12));
        assert_eq!(decode::<Task>(&raw).unwrap(), task());
    }

    #[test]
    fn test_result_envelope_carries_records() {
        let result = TaskResult {
            records: vec![Record::new("https://listings.example.com/a").with_identity("A")],
            ..TaskResult::empty(&task())
        };
        let decoded: TaskResult = decode(&encode(&result).unwrap()).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let raw = encode(&task()).unwrap();
        assert!(matches!(
            decode::<TaskResult>(&raw),
            Err(QueueError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let raw = json!({
            "version": ENVELOPE_VERSION + 1,
            "kind": "task",
            "body": { "id": 1, "page_number": 1, "in_work": true, "completed": false }
        })
        .to_string();
        assert!(matches!(
            decode::<Task>(&raw),
            Err(QueueError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_body_field_rejected() {
        let raw = json!({
            "version": ENVELOPE_VERSION,
            "kind": "task",
            "body": { "id": 1, "page_number": 1, "in_work": true, "completed": false, "priority": 5 }
        })
        .to_string();
        assert!(matches!(
            decode::<Task>(&raw),
            Err(QueueError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_positional_payload_rejected() {
        // a bare tuple from an older producer
        let raw = json!([1, 1, true, false]).to_string();
        assert!(matches!(decode::<Task>(&raw), Err(QueueError::Json(_))));
    }
}
