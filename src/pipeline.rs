//! Event and generation pipelines
//!
//! The event pipeline is a serial chain of synchronous transforms applied
//! to an inbound event. The generation pipeline fans the event out: all
//! generators run concurrently, each publishing zero or more messages to
//! the event's tmp generation queue.

use crate::broker::Broker;
use crate::error::Result;
use crate::event::Event;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Flow outcome of an event pipeline step
#[derive(Debug, Clone)]
pub enum FilterError {
    /// Silently discard the event
    Drop,
    /// Discard the event; the step knows when it would become relevant
    Delay(Duration),
    /// Unexpected step failure (logged; the event is still consumed)
    Failed(String),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Drop => write!(f, "event dropped"),
            FilterError::Delay(delay) => write!(f, "event delayed for {delay:?}"),
            FilterError::Failed(reason) => write!(f, "filter failed: {reason}"),
        }
    }
}

/// One synchronous transform of the event pipeline
///
/// Steps mutate by return: the produced event flows into the next step.
pub trait EventFilter: Send + Sync {
    fn process(&self, event: Event) -> std::result::Result<Event, FilterError>;
}

/// Serial chain of event filters
#[derive(Clone, Default)]
pub struct EventPipeline {
    filters: Vec<Arc<dyn EventFilter>>,
}

impl EventPipeline {
    pub fn new(filters: Vec<Arc<dyn EventFilter>>) -> Self {
        Self { filters }
    }

    /// Pipeline with no steps (events pass through unchanged)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Run the event through every step in order
    pub fn process(&self, mut event: Event) -> std::result::Result<Event, FilterError> {
        for filter in &self.filters {
            event = filter.process(event)?;
        }
        Ok(event)
    }
}

/// Publishes generated messages into one tmp generation queue
///
/// The routing key is the queue name (default exchange).
pub struct GenerationSink {
    broker: Arc<dyn Broker>,
    queue_name: String,
}

impl GenerationSink {
    pub fn new(broker: Arc<dyn Broker>, queue_name: impl Into<String>) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Publish a generated message to the tmp queue
    pub async fn publish(&self, message: &Message) -> Result<()> {
        self.broker
            .publish("", &self.queue_name, message.to_bytes())
            .await
    }
}

/// Produces messages from one event
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, event: &Event, sink: &GenerationSink) -> Result<()>;
}

/// Parallel set of generators for an event type
#[derive(Clone, Default)]
pub struct GenerationPipeline {
    generators: Vec<Arc<dyn Generator>>,
}

impl GenerationPipeline {
    pub fn new(generators: Vec<Arc<dyn Generator>>) -> Self {
        Self { generators }
    }

    /// Run all generators concurrently; failures are logged per generator
    pub async fn run(&self, event: &Event, sink: &GenerationSink) {
        let results = futures::future::join_all(
            self.generators
                .iter()
                .map(|generator| generator.generate(event, sink)),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                tracing::error!(
                    event_id = %event.id,
                    queue = sink.queue_name(),
                    error = %e,
                    "Generator failed"
                );
            }
        }
    }
}

/// Pass-through event filter
pub struct NoopFilter;

impl EventFilter for NoopFilter {
    fn process(&self, event: Event) -> std::result::Result<Event, FilterError> {
        Ok(event)
    }
}

/// Insert a fixed key/value into the event payload
///
/// The annotated event flows into the next step; steps mutate by return,
/// never in place on shared state.
pub struct AnnotateFilter {
    key: String,
    value: serde_json::Value,
}

impl AnnotateFilter {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl EventFilter for AnnotateFilter {
    fn process(&self, mut event: Event) -> std::result::Result<Event, FilterError> {
        if let serde_json::Value::Object(payload) = &mut event.payload {
            payload.insert(self.key.clone(), self.value.clone());
        }
        Ok(event)
    }
}

/// Drop events whose payload is empty
pub struct DropEmptyFilter;

impl EventFilter for DropEmptyFilter {
    fn process(&self, event: Event) -> std::result::Result<Event, FilterError> {
        let empty = match &event.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Err(FilterError::Drop);
        }
        Ok(event)
    }
}

/// Generate a fixed number of messages per event
///
/// Each message carries `{"a": i}` as content.
pub struct CountGenerator {
    count: usize,
}

impl CountGenerator {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

#[async_trait]
impl Generator for CountGenerator {
    async fn generate(&self, event: &Event, sink: &GenerationSink) -> Result<()> {
        for i in 0..self.count {
            let message = Message::from_event(event, serde_json::json!({ "a": i }));
            sink.publish(&message).await?;
        }
        Ok(())
    }
}
