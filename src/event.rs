//! Inbound event data model
//!
//! Events arrive on the `events.<type>` queue as small JSON envelopes and
//! are fanned out into [`Message`](crate::message::Message)s by generators.

use serde::{Deserialize, Serialize};

/// An inbound notification of some type with an opaque payload
///
/// Wire schema: `{ "id": string, "type": string, "payload": object }`.
/// The `id` is optional on the wire and generated when absent; once set it
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    #[serde(default = "gen_event_id")]
    pub id: String,

    /// Event type (selects the pipeline configuration)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque payload map
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn gen_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Event {
    /// Create a new event with an auto-generated id
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: gen_event_id(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Create an event with an explicit id
    pub fn with_id(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}
