//! Message data model — the unit of delivery
//!
//! Messages are spawned from events by generators, serialized as JSON for
//! broker transit, and reconstructed verbatim at each hop. The route is the
//! message's per-effect progress record: it grows by first encounter and is
//! updated in place as the pipeline advances.

use crate::effects::Effect;
use crate::error::{CourierError, Result};
use crate::event::Event;
use crate::outputs::OutputRegistry;

/// Route entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    Pending = 1,
    Finished = 2,
    Failed = 3,
}

impl EffectStatus {
    /// Wire integer
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Parse the wire integer
    pub fn from_wire(value: u64) -> Result<Self> {
        match value {
            1 => Ok(EffectStatus::Pending),
            2 => Ok(EffectStatus::Finished),
            3 => Ok(EffectStatus::Failed),
            other => Err(CourierError::Codec(format!(
                "invalid effect status: {other}"
            ))),
        }
    }
}

/// A message's progress record for one effect
///
/// At most one route entry exists per effect identity; entries are ordered
/// by first encounter.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub effect: Effect,
    pub status: EffectStatus,
    /// Effect-defined state, kept in wire form
    pub state: serde_json::Value,
    pub retry_count: u32,
}

/// A unit of delivery
///
/// `id` and `event_type` are set at construction and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub event_type: String,
    pub content: serde_json::Value,
    pub meta: Option<serde_json::Value>,
    pub route: Vec<Route>,
}

impl Message {
    /// Create a message with an explicit id
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            content: serde_json::json!({}),
            meta: None,
            route: Vec::new(),
        }
    }

    /// Create a message spawned from an event, deriving the id from the
    /// event id
    pub fn from_event(event: &Event, content: serde_json::Value) -> Self {
        Self {
            id: format!("{}.{}", event.id, uuid::Uuid::new_v4().simple()),
            event_type: event.event_type.clone(),
            content,
            meta: None,
            route: Vec::new(),
        }
    }

    /// Set the content
    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    /// Set the meta map
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    fn find_route(&self, effect: &Effect) -> Option<&Route> {
        self.route.iter().find(|r| &r.effect == effect)
    }

    fn find_route_mut(&mut self, effect: &Effect) -> Option<&mut Route> {
        self.route.iter_mut().find(|r| &r.effect == effect)
    }

    /// Route status for an effect, if the effect has been encountered
    pub fn route_status(&self, effect: &Effect) -> Option<EffectStatus> {
        self.find_route(effect).map(|r| r.status)
    }

    /// Effect state from the last apply, if any
    pub fn route_state(&self, effect: &Effect) -> Option<&serde_json::Value> {
        self.find_route(effect).map(|r| &r.state)
    }

    /// Retry counter for an effect (zero when not yet encountered)
    pub fn route_retry(&self, effect: &Effect) -> u32 {
        self.find_route(effect).map(|r| r.retry_count).unwrap_or(0)
    }

    /// Store state and status for an effect, creating the route entry on
    /// first encounter
    pub fn set_route_state(
        &mut self,
        effect: &Effect,
        state: serde_json::Value,
        status: EffectStatus,
    ) {
        match self.find_route_mut(effect) {
            Some(route) => {
                route.state = state;
                route.status = status;
            }
            None => self.route.push(Route {
                effect: effect.clone(),
                status,
                state,
                retry_count: 0,
            }),
        }
    }

    /// Set the retry counter for an effect, creating the route entry on
    /// first encounter
    pub fn set_route_retry(&mut self, effect: &Effect, retry_count: u32) {
        match self.find_route_mut(effect) {
            Some(route) => route.retry_count = retry_count,
            None => self.route.push(Route {
                effect: effect.clone(),
                status: EffectStatus::Pending,
                state: serde_json::Value::Null,
                retry_count,
            }),
        }
    }

    /// Wire form
    ///
    /// Route entries serialize as `[effect, status, state, retry_count]`.
    pub fn to_json(&self) -> serde_json::Value {
        let route: Vec<serde_json::Value> = self
            .route
            .iter()
            .map(|r| {
                serde_json::json!([
                    r.effect.to_wire(),
                    r.status.to_wire(),
                    r.state,
                    r.retry_count,
                ])
            })
            .collect();

        serde_json::json!({
            "id": self.id,
            "event_type": self.event_type,
            "content": self.content,
            "meta": self.meta,
            "route": route,
        })
    }

    /// Serialize to a UTF-8 JSON body
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// Decode the wire form, resolving route effects against the registry
    pub fn from_json(value: &serde_json::Value, registry: &OutputRegistry) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CourierError::Codec("message has no id".to_string()))?
            .to_string();
        let event_type = value
            .get("event_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CourierError::Codec("message has no event_type".to_string()))?
            .to_string();
        let content = value.get("content").cloned().unwrap_or(serde_json::json!({}));
        let meta = match value.get("meta") {
            None | Some(serde_json::Value::Null) => None,
            Some(meta) => Some(meta.clone()),
        };

        let mut route = Vec::new();
        if let Some(entries) = value.get("route") {
            let entries = entries.as_array().ok_or_else(|| {
                CourierError::Codec(format!("message route is not an array: {entries}"))
            })?;
            for entry in entries {
                route.push(Self::route_from_wire(entry, registry)?);
            }
        }

        Ok(Self {
            id,
            event_type,
            content,
            meta,
            route,
        })
    }

    /// Decode a UTF-8 JSON body
    pub fn from_bytes(body: &[u8], registry: &OutputRegistry) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        Self::from_json(&value, registry)
    }

    fn route_from_wire(entry: &serde_json::Value, registry: &OutputRegistry) -> Result<Route> {
        let parts = entry
            .as_array()
            .ok_or_else(|| CourierError::Codec(format!("route entry is not an array: {entry}")))?;
        if parts.len() != 4 {
            return Err(CourierError::Codec(format!(
                "route entry has {} parts, expected 4",
                parts.len()
            )));
        }

        let effect = Effect::from_wire(&parts[0], registry)?;
        let status = parts[1]
            .as_u64()
            .ok_or_else(|| {
                CourierError::Codec(format!("route status is not an integer: {}", parts[1]))
            })
            .and_then(EffectStatus::from_wire)?;
        let state = parts[2].clone();
        if !state.is_null() {
            effect.validate_state(&state)?;
        }
        let retry_count = parts[3].as_u64().ok_or_else(|| {
            CourierError::Codec(format!("route retry count is not an integer: {}", parts[3]))
        })? as u32;

        Ok(Route {
            effect,
            status,
            state,
            retry_count,
        })
    }
}
