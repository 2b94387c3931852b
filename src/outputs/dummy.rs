//! Built-in output backends
//!
//! Mostly useful for tests and for measuring clean messaging throughput
//! with no regard to real output latency.

use super::{OutputBackend, OutputSpec, SendError};
use crate::message::Message;

/// Send messages to nowhere
///
/// Every send succeeds immediately. Keyword arguments are retained so two
/// differently-configured null outputs have distinct identities in a route.
pub struct NullOutput {
    spec: OutputSpec,
}

impl NullOutput {
    pub fn new() -> Self {
        Self {
            spec: OutputSpec::named("null"),
        }
    }

    /// Null output tagged with a `test_arg` kwarg, giving it a distinct
    /// serialized identity
    pub fn tagged(test_arg: i64) -> Self {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("test_arg".to_string(), serde_json::json!(test_arg));
        Self {
            spec: OutputSpec::with_kwargs("null", kwargs),
        }
    }

    pub fn from_spec(spec: &OutputSpec) -> Self {
        Self { spec: spec.clone() }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for NullOutput {
    fn name(&self) -> &str {
        "null"
    }

    fn spec(&self) -> OutputSpec {
        self.spec.clone()
    }

    fn send(&self, _message: &Message, _retry: u32) -> Result<bool, SendError> {
        Ok(true)
    }
}

/// Send messages to the worker log
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for ConsoleOutput {
    fn name(&self) -> &str {
        "console"
    }

    fn spec(&self) -> OutputSpec {
        OutputSpec::named("console")
    }

    fn send(&self, message: &Message, _retry: u32) -> Result<bool, SendError> {
        tracing::info!(
            message_id = %message.id,
            event_type = %message.event_type,
            content = %message.content,
            "Message delivered"
        );
        Ok(true)
    }
}

/// Always failing output backend
pub struct FailingOutput;

impl FailingOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FailingOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for FailingOutput {
    fn name(&self) -> &str {
        "failing"
    }

    fn spec(&self) -> OutputSpec {
        OutputSpec::named("failing")
    }

    fn send(&self, _message: &Message, _retry: u32) -> Result<bool, SendError> {
        Err(SendError::Failed("failing output fail (just test)".to_string()))
    }
}

/// Output that never delivers — `send` always returns false
pub struct NeverDeliveredOutput;

impl NeverDeliveredOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NeverDeliveredOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for NeverDeliveredOutput {
    fn name(&self) -> &str {
        "never"
    }

    fn spec(&self) -> OutputSpec {
        OutputSpec::named("never")
    }

    fn send(&self, _message: &Message, _retry: u32) -> Result<bool, SendError> {
        Ok(false)
    }
}

/// Send message and verify delivery on a later pass
///
/// Instead of succeeding outright, this output makes one additional cycle
/// through the messages queue for a delivery check (which then succeeds).
pub struct CheckOutput;

impl CheckOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CheckOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for CheckOutput {
    fn name(&self) -> &str {
        "check"
    }

    fn spec(&self) -> OutputSpec {
        OutputSpec::named("check")
    }

    fn send(&self, _message: &Message, _retry: u32) -> Result<bool, SendError> {
        Err(SendError::CheckDelivery { delay: None })
    }

    fn check(&self, _message: &Message) -> Result<bool, SendError> {
        Ok(true)
    }
}

/// Retry sending until the requested number of retries is reached
pub struct RetryOutput {
    retries: u32,
}

impl RetryOutput {
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }
}

impl OutputBackend for RetryOutput {
    fn name(&self) -> &str {
        "retry"
    }

    fn spec(&self) -> OutputSpec {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("retries".to_string(), serde_json::json!(self.retries));
        OutputSpec::with_kwargs("retry", kwargs)
    }

    fn send(&self, _message: &Message, retry: u32) -> Result<bool, SendError> {
        if retry < self.retries {
            return Err(SendError::Retry {
                reason: "test retry".to_string(),
                delay: None,
            });
        }
        Ok(true)
    }
}
