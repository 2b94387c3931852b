//! Output backend abstraction — pluggable sinks for message delivery
//!
//! An output backend transmits a message to an external system (SMS, push,
//! e-mail, …). Backends are serializable values: each instance retains the
//! registry path and construction arguments it was built from, so a backend
//! embedded in a message route round-trips through JSON. The
//! [`OutputRegistry`] maps registered paths back to constructors.

use crate::error::{CourierError, Result};
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod dummy;

pub use dummy::{
    CheckOutput, ConsoleOutput, FailingOutput, NeverDeliveredOutput, NullOutput, RetryOutput,
};

/// Serialized form of an output backend: `[path, args, kwargs]`
///
/// `path` is the key the backend's constructor is registered under.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputSpec {
    pub path: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl OutputSpec {
    /// Spec with no construction arguments
    pub fn named(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Spec with keyword arguments
    pub fn with_kwargs(
        path: impl Into<String>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            kwargs,
        }
    }

    /// Wire form: `[path, args, kwargs]`
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!([self.path, self.args, self.kwargs])
    }

    /// Parse the wire form
    pub fn from_wire(value: &serde_json::Value) -> Result<Self> {
        let parts = value
            .as_array()
            .ok_or_else(|| CourierError::Codec(format!("output spec is not an array: {value}")))?;
        let path = parts
            .first()
            .and_then(|p| p.as_str())
            .ok_or_else(|| CourierError::Codec("output spec has no path".to_string()))?
            .to_string();
        let args = match parts.get(1) {
            Some(serde_json::Value::Array(args)) => args.clone(),
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(other) => {
                return Err(CourierError::Codec(format!(
                    "output args is not an array: {other}"
                )))
            }
        };
        let kwargs = match parts.get(2) {
            Some(serde_json::Value::Object(kwargs)) => kwargs.clone(),
            None | Some(serde_json::Value::Null) => serde_json::Map::new(),
            Some(other) => {
                return Err(CourierError::Codec(format!(
                    "output kwargs is not an object: {other}"
                )))
            }
        };
        Ok(Self { path, args, kwargs })
    }

    /// Read an integer keyword argument
    pub fn kwarg_u32(&self, key: &str, default: u32) -> u32 {
        self.kwargs
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(default)
    }
}

/// Flow-control outcome of a backend `send`/`check` call
///
/// `Retry` and `CheckDelivery` are state transitions, not failures: the
/// effect state machine records them in the affected slot. Only `Failed`
/// propagates to the consumer (which logs it and leaves the route pending).
#[derive(Debug, Clone)]
pub enum SendError {
    /// The backend cannot deliver right now; retry on the next wave
    Retry {
        reason: String,
        /// Advisory delay before the next try. Carried for backends that
        /// know their retry cadence; delivery scheduling does not honor it.
        delay: Option<Duration>,
    },

    /// Delivery must be verified on a later pass
    CheckDelivery { delay: Option<Duration> },

    /// The backend does not support delivery checks
    NoDeliveryCheck,

    /// Unexpected backend failure
    Failed(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Retry { reason, .. } => write!(f, "retry requested: {reason}"),
            SendError::CheckDelivery { .. } => write!(f, "delivery check requested"),
            SendError::NoDeliveryCheck => write!(f, "backend has no delivery check"),
            SendError::Failed(reason) => write!(f, "send failed: {reason}"),
        }
    }
}

/// A pluggable sink that transmits a message to an external system
///
/// `send` and `check` are synchronous: user code runs on the task that
/// received the delivery, never on broker I/O tasks.
pub trait OutputBackend: Send + Sync {
    /// Short backend name — used as the routing key on `output.<type>`
    fn name(&self) -> &str;

    /// Serializable construction spec
    fn spec(&self) -> OutputSpec;

    /// Send the message through this backend
    ///
    /// `retry` is the route's retry counter for the owning effect.
    /// Returning `Ok(false)` marks the slot FAIL; any `Ok(true)` marks it
    /// SUCCESS.
    fn send(&self, message: &Message, retry: u32) -> std::result::Result<bool, SendError>;

    /// Check delivery status for a previously sent message
    fn check(&self, _message: &Message) -> std::result::Result<bool, SendError> {
        Err(SendError::NoDeliveryCheck)
    }
}

impl fmt::Debug for dyn OutputBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Output:{}>", self.name())
    }
}

/// Constructor for a registered output backend
pub type OutputCtor =
    Arc<dyn Fn(&OutputSpec) -> Result<Arc<dyn OutputBackend>> + Send + Sync>;

/// Registry mapping output paths to constructors
///
/// Built explicitly at startup; message decoding resolves route outputs
/// against it.
#[derive(Clone)]
pub struct OutputRegistry {
    ctors: HashMap<String, OutputCtor>,
}

impl OutputRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in backends
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", |spec| Ok(Arc::new(NullOutput::from_spec(spec)) as _));
        registry.register("console", |_| Ok(Arc::new(ConsoleOutput::new()) as _));
        registry.register("failing", |_| Ok(Arc::new(FailingOutput::new()) as _));
        registry.register("never", |_| Ok(Arc::new(NeverDeliveredOutput::new()) as _));
        registry.register("check", |_| Ok(Arc::new(CheckOutput::new()) as _));
        registry.register("retry", |spec| {
            Ok(Arc::new(RetryOutput::new(spec.kwarg_u32("retries", 1))) as _)
        });
        registry
    }

    /// Register a constructor under a path
    ///
    /// Re-registering a path replaces the previous constructor.
    pub fn register<F>(&mut self, path: impl Into<String>, ctor: F)
    where
        F: Fn(&OutputSpec) -> Result<Arc<dyn OutputBackend>> + Send + Sync + 'static,
    {
        self.ctors.insert(path.into(), Arc::new(ctor));
    }

    /// Build a backend instance from its spec
    pub fn build(&self, spec: &OutputSpec) -> Result<Arc<dyn OutputBackend>> {
        let ctor = self
            .ctors
            .get(&spec.path)
            .ok_or_else(|| CourierError::UnknownOutput(spec.path.clone()))?;
        ctor(spec)
    }

    /// Whether a path is registered
    pub fn contains(&self, path: &str) -> bool {
        self.ctors.contains_key(path)
    }
}

impl Default for OutputRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
