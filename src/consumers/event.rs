//! Event consumer
//!
//! Receives inbound events from `events.<type>`, runs the event pipeline,
//! fans the event out through the generators into a fresh tmp generation
//! queue, and announces the queue on the cluster bus.

use crate::broker::{Broker, QueueSpec};
use crate::cluster::Cluster;
use crate::consumers::base::{Handler, Runner};
use crate::error::Result;
use crate::event::Event;
use crate::pipeline::{EventPipeline, FilterError, GenerationPipeline, GenerationSink};
use async_trait::async_trait;
use std::sync::Arc;

/// Consumes `events.<type>`; one instance per event type per worker
pub struct EventConsumer {
    event_type: String,
    runner: Runner,
}

impl EventConsumer {
    /// Declare the event queue and start consuming
    pub async fn start(
        event_type: impl Into<String>,
        pipeline: EventPipeline,
        generators: GenerationPipeline,
        broker: Arc<dyn Broker>,
        cluster: Arc<Cluster>,
    ) -> Result<Self> {
        let event_type = event_type.into();
        let runner = Runner::new("EventConsumer");
        runner.start_monitor().await;

        let spec = QueueSpec::events(&event_type);
        broker.declare(&spec).await?;
        let consumer = broker.consume(&spec.name).await?;

        let handler = Arc::new(EventHandler {
            event_type: event_type.clone(),
            pipeline,
            generators,
            broker: Arc::clone(&broker),
            cluster,
        });
        let handle = runner.spawn_consume(broker, consumer, handler);
        runner.track(handle).await;

        tracing::info!(event_type = %event_type, queue = %spec.name, "Event consumer started");
        Ok(Self { event_type, runner })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }
}

struct EventHandler {
    event_type: String,
    pipeline: EventPipeline,
    generators: GenerationPipeline,
    broker: Arc<dyn Broker>,
    cluster: Arc<Cluster>,
}

impl EventHandler {
    async fn handle_event(&self, event: Event) -> Result<()> {
        tracing::info!(event_id = %event.id, "Start generation");

        let spec = QueueSpec::generation(&self.event_type);
        self.broker.declare(&spec).await?;

        let sink = GenerationSink::new(Arc::clone(&self.broker), spec.name.clone());
        self.generators.run(&event, &sink).await;

        // Announce cluster-wide; whichever workers pick it up drain it
        self.cluster.start_consume(&spec.name).await?;

        tracing::info!(event_id = %event.id, queue = %spec.name, "Generation finished");
        Ok(())
    }
}

#[async_trait]
impl Handler for EventHandler {
    async fn handle(&self, _queue: &str, body: serde_json::Value) {
        let event: Event = match serde_json::from_value(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(event_type = %self.event_type, error = %e, "Malformed event");
                return;
            }
        };
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Event received");

        let event = match self.pipeline.process(event) {
            Ok(event) => event,
            Err(FilterError::Drop) => {
                tracing::debug!(event_type = %self.event_type, "Event dropped by pipeline");
                return;
            }
            Err(FilterError::Delay(delay)) => {
                tracing::debug!(event_type = %self.event_type, delay = ?delay, "Event delayed, discarding");
                return;
            }
            Err(FilterError::Failed(reason)) => {
                tracing::error!(event_type = %self.event_type, reason = %reason, "Event pipeline failed");
                return;
            }
        };

        if let Err(e) = self.handle_event(event).await {
            tracing::error!(event_type = %self.event_type, error = %e, "Exception in event handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::cluster::{Cluster, ClusterHandlers};
    use crate::pipeline::{CountGenerator, DropEmptyFilter};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn started_cluster(
        broker: Arc<MemoryBroker>,
    ) -> (Arc<Cluster>, mpsc::Receiver<String>) {
        let (start_tx, start_rx) = mpsc::channel(16);
        let (output_tx, _output_rx) = mpsc::channel(16);
        let mut cluster = Cluster::new(
            broker,
            ClusterHandlers {
                start_consume: start_tx,
                output_observed: output_tx,
            },
        );
        cluster.start().await.unwrap();
        (Arc::new(cluster), start_rx)
    }

    #[tokio::test]
    async fn test_event_spawns_generation_and_announces() {
        let broker = Arc::new(MemoryBroker::new());
        let (cluster, mut start_rx) = started_cluster(broker.clone()).await;

        let consumer = EventConsumer::start(
            "example_event",
            EventPipeline::empty(),
            GenerationPipeline::new(vec![Arc::new(CountGenerator::new(2))]),
            broker.clone(),
            cluster.clone(),
        )
        .await
        .unwrap();

        broker
            .publish_json(
                "",
                "events.example_event",
                &serde_json::json!({"type": "example_event", "payload": {"a": 1}}),
            )
            .await
            .unwrap();

        let queue_name = tokio::time::timeout(Duration::from_secs(1), start_rx.recv())
            .await
            .expect("no generation announcement")
            .expect("channel closed");
        assert!(queue_name.starts_with("gen.example_event."));
        assert_eq!(broker.queue_depth(&queue_name), 2);

        consumer.stop().await;
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_event_is_silently_consumed() {
        let broker = Arc::new(MemoryBroker::new());
        let (cluster, mut start_rx) = started_cluster(broker.clone()).await;

        let consumer = EventConsumer::start(
            "example_event",
            EventPipeline::new(vec![Arc::new(DropEmptyFilter)]),
            GenerationPipeline::new(vec![Arc::new(CountGenerator::new(1))]),
            broker.clone(),
            cluster.clone(),
        )
        .await
        .unwrap();

        broker
            .publish_json(
                "",
                "events.example_event",
                &serde_json::json!({"type": "example_event", "payload": {}}),
            )
            .await
            .unwrap();

        // No announcement, event acked, nothing generated
        assert!(
            tokio::time::timeout(Duration::from_millis(200), start_rx.recv())
                .await
                .is_err()
        );
        assert_eq!(broker.queue_depth("events.example_event"), 0);
        assert_eq!(broker.unacked(), 0);

        consumer.stop().await;
        cluster.stop().await;
    }
}
