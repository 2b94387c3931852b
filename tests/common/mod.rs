//! Shared helpers for integration tests
#![allow(dead_code)]

use courier::{Message, OutputBackend, OutputRegistry, OutputSpec, SendError};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

static SINKS: OnceLock<Mutex<HashMap<String, Vec<String>>>> = OnceLock::new();

fn sinks() -> &'static Mutex<HashMap<String, Vec<String>>> {
    SINKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Output backend that records delivered message ids under a tag
///
/// The tag keeps concurrently running tests apart; it also round-trips
/// through the wire spec, so re-decoded messages keep recording into the
/// same bucket.
pub struct CollectOutput {
    tag: String,
}

impl CollectOutput {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    /// Message ids delivered under a tag so far
    pub fn delivered(tag: &str) -> Vec<String> {
        sinks()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn delivered_count(tag: &str) -> usize {
        Self::delivered(tag).len()
    }
}

impl OutputBackend for CollectOutput {
    fn name(&self) -> &str {
        "collect"
    }

    fn spec(&self) -> OutputSpec {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("tag".to_string(), serde_json::json!(self.tag));
        OutputSpec::with_kwargs("collect", kwargs)
    }

    fn send(&self, message: &Message, _retry: u32) -> Result<bool, SendError> {
        sinks()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(self.tag.clone())
            .or_default()
            .push(message.id.clone());
        Ok(true)
    }
}

/// Register the collect output in a registry
pub fn register_collect(outputs: &mut OutputRegistry) {
    outputs.register("collect", |spec| {
        let tag = spec
            .kwargs
            .get("tag")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(std::sync::Arc::new(CollectOutput::new(tag)) as _)
    });
}

/// Poll a condition until it holds or a generous deadline passes
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
