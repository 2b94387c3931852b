//! Output consumer
//!
//! Consumes `output.<type>` for one output, invokes the backend through
//! the router, and requeues the message on `messages.<type>` while the
//! pipeline has further steps. Backend failures are logged and the
//! delivery is acked regardless — retry is encoded in route state, not in
//! broker redelivery.

use crate::broker::{Broker, QueueSpec};
use crate::consumers::base::{Handler, Runner};
use crate::error::Result;
use crate::message::Message;
use crate::outputs::OutputRegistry;
use crate::router::Router;
use async_trait::async_trait;
use std::sync::Arc;

/// Consumes `output.<type>`; one instance per `(event_type, output)`
pub struct OutputConsumer {
    output_name: String,
    runner: Runner,
}

impl OutputConsumer {
    /// Declare the output binding and start consuming
    pub async fn start(
        event_type: impl Into<String>,
        output_name: impl Into<String>,
        router: Router,
        registry: Arc<OutputRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let event_type = event_type.into();
        let output_name = output_name.into();
        let runner = Runner::new("OutputConsumer");
        runner.start_monitor().await;

        let spec = QueueSpec::output(&event_type, &output_name);
        broker.declare(&spec).await?;
        // The requeue target must exist even if no local message consumer
        // declared it yet
        broker.declare(&QueueSpec::messages(&event_type)).await?;
        let consumer = broker.consume(&spec.name).await?;

        let handler = Arc::new(OutputHandler {
            event_type: event_type.clone(),
            router,
            registry,
            broker: Arc::clone(&broker),
        });
        let handle = runner.spawn_consume(broker, consumer, handler);
        runner.track(handle).await;

        tracing::info!(
            event_type = %event_type,
            output = %output_name,
            queue = %spec.name,
            "Output consumer started"
        );
        Ok(Self {
            output_name,
            runner,
        })
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }
}

struct OutputHandler {
    event_type: String,
    router: Router,
    registry: Arc<OutputRegistry>,
    broker: Arc<dyn Broker>,
}

#[async_trait]
impl Handler for OutputHandler {
    async fn handle(&self, _queue: &str, body: serde_json::Value) {
        let mut message = match Message::from_json(&body, &self.registry) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(event_type = %self.event_type, error = %e, "Malformed message");
                return;
            }
        };

        if let Err(e) = self.router.apply_next_effect(&mut message) {
            // Route stays pending; the requeue below drives the retry
            tracing::error!(
                message_id = %message.id,
                event_type = %self.event_type,
                error = %e,
                "Output backend failed"
            );
        }

        if self.router.next_effect(&message).is_some() {
            if let Err(e) = self.requeue(&message).await {
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to reschedule message"
                );
            }
        } else {
            tracing::info!(message_id = %message.id, "Delivery finished");
        }
    }
}

impl OutputHandler {
    async fn requeue(&self, message: &Message) -> Result<()> {
        let exchange = format!("messages.{}", self.event_type);
        self.broker
            .publish_json(&exchange, &self.event_type, &message.to_json())
            .await?;
        tracing::debug!(
            message_id = %message.id,
            exchange = %exchange,
            "Message rescheduled on messages queue"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::effects::send;
    use crate::outputs::{FailingOutput, NullOutput, RetryOutput};
    use std::time::Duration;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn deliver(broker: &MemoryBroker, message: &Message) {
        broker
            .publish_json("output.example_event", "null", &message.to_json())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_message_is_not_requeued() {
        let broker = Arc::new(MemoryBroker::new());
        let router = Router::new(Arc::new(|_m: &Message| {
            vec![send(vec![Arc::new(NullOutput::new())])]
        }));

        let consumer = OutputConsumer::start(
            "example_event",
            "null",
            router,
            Arc::new(OutputRegistry::with_builtins()),
            broker.clone(),
        )
        .await
        .unwrap();

        deliver(&broker, &Message::new("m1", "example_event")).await;

        let broker_check = broker.clone();
        wait_for(move || {
            broker_check.queue_depth("output.example_event") == 0
                && broker_check.unacked() == 0
        })
        .await;
        assert_eq!(broker.queue_depth("messages.example_event"), 0);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_incomplete_pipeline_requeues() {
        let broker = Arc::new(MemoryBroker::new());
        // Two-step pipeline: the first application leaves the second step
        // pending, so the message must go around again
        let router = Router::new(Arc::new(|_m: &Message| {
            vec![
                send(vec![Arc::new(NullOutput::tagged(1))]),
                send(vec![Arc::new(NullOutput::tagged(2))]),
            ]
        }));

        let consumer = OutputConsumer::start(
            "example_event",
            "null",
            router,
            Arc::new(OutputRegistry::with_builtins()),
            broker.clone(),
        )
        .await
        .unwrap();

        deliver(&broker, &Message::new("m1", "example_event")).await;

        let broker_check = broker.clone();
        wait_for(move || broker_check.queue_depth("messages.example_event") == 1).await;

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_backend_failure_requeues_with_route_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let router = Router::new(Arc::new(|_m: &Message| {
            vec![send(vec![Arc::new(FailingOutput::new())])]
        }));

        let consumer = OutputConsumer::start(
            "example_event",
            "null",
            router,
            Arc::new(OutputRegistry::with_builtins()),
            broker.clone(),
        )
        .await
        .unwrap();

        deliver(&broker, &Message::new("m1", "example_event")).await;

        // The failed apply leaves the effect pending: requeued, acked
        let broker_check = broker.clone();
        wait_for(move || {
            broker_check.queue_depth("messages.example_event") == 1
                && broker_check.unacked() == 0
        })
        .await;

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_retry_message_carries_updated_route() {
        let broker = Arc::new(MemoryBroker::new());
        let registry = Arc::new(OutputRegistry::with_builtins());
        let router = Router::new(Arc::new(|_m: &Message| {
            vec![send(vec![Arc::new(RetryOutput::new(1))])]
        }));

        let consumer = OutputConsumer::start(
            "example_event",
            "null",
            router,
            registry.clone(),
            broker.clone(),
        )
        .await
        .unwrap();

        let mut message = Message::new("m1", "example_event");
        message.content = serde_json::json!({"a": 0});
        broker
            .publish_json("output.example_event", "null", &message.to_json())
            .await
            .unwrap();

        let broker_check = broker.clone();
        wait_for(move || broker_check.queue_depth("messages.example_event") == 1).await;

        // Inspect the requeued wire message: slot RETRY, retry counter 1
        let mut requeued = broker.consume("messages.example_event").await.unwrap();
        let delivery = requeued.next().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(delivery.body()).unwrap();
        let message = Message::from_json(&body, &registry).unwrap();
        assert_eq!(message.route.len(), 1);
        assert_eq!(message.route[0].retry_count, 1);
        assert_eq!(message.route[0].state, serde_json::json!([5]));
        delivery.ack().await.unwrap();

        consumer.stop().await;
    }
}
