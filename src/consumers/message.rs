//! Message consumer
//!
//! Consumes `messages.<type>`, asks the router for the next pipeline step,
//! and routes the message to the per-output queue. Newly selected outputs
//! are announced to the local manager, which starts an output consumer and
//! broadcasts the observation to the cluster.

use crate::broker::{Broker, QueueSpec};
use crate::consumers::base::{Handler, Runner};
use crate::error::Result;
use crate::message::Message;
use crate::outputs::{OutputRegistry, OutputSpec};
use crate::router::Router;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consumes `messages.<type>`; one instance per event type per worker
pub struct MessageConsumer {
    runner: Runner,
}

impl MessageConsumer {
    /// Declare the messages queue and output exchange, then start
    /// consuming
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        event_type: impl Into<String>,
        router: Router,
        registry: Arc<OutputRegistry>,
        available_outputs: Option<HashSet<String>>,
        observed_tx: mpsc::Sender<(String, OutputSpec)>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let event_type = event_type.into();
        let runner = Runner::new("MessageConsumer");
        runner.start_monitor().await;

        let spec = QueueSpec::messages(&event_type);
        broker.declare(&spec).await?;
        broker
            .declare_exchange(
                &format!("output.{event_type}"),
                crate::broker::ExchangeKind::Direct,
            )
            .await?;
        let consumer = broker.consume(&spec.name).await?;

        let handler = Arc::new(MessageHandler {
            event_type: event_type.clone(),
            router,
            registry,
            available_outputs,
            observed_tx,
            broker: Arc::clone(&broker),
        });
        let handle = runner.spawn_consume(broker, consumer, handler);
        runner.track(handle).await;

        tracing::info!(event_type = %event_type, queue = %spec.name, "Message consumer started");
        Ok(Self { runner })
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }
}

struct MessageHandler {
    event_type: String,
    router: Router,
    registry: Arc<OutputRegistry>,
    available_outputs: Option<HashSet<String>>,
    observed_tx: mpsc::Sender<(String, OutputSpec)>,
    broker: Arc<dyn Broker>,
}

impl MessageHandler {
    async fn route(&self, mut message: Message) -> Result<()> {
        loop {
            let Some(effect) = self.router.next_effect(&message) else {
                tracing::info!(message_id = %message.id, "End of pipeline");
                return Ok(());
            };

            let Some(action) = effect.next_action(message.route_state(&effect)) else {
                // Route status lagged behind an already-complete state
                message.set_route_state(
                    &effect,
                    message
                        .route_state(&effect)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                    crate::message::EffectStatus::Finished,
                );
                continue;
            };

            let output = Arc::clone(action.output());

            if let Some(available) = &self.available_outputs {
                if !available.contains(output.name()) {
                    tracing::warn!(
                        message_id = %message.id,
                        output = output.name(),
                        "Output not available, skipping"
                    );
                    self.router.skip_next_effect(&mut message);
                    continue;
                }
            }

            // Let the manager start an output consumer and tell the cluster
            if let Err(e) = self
                .observed_tx
                .send((self.event_type.clone(), output.spec()))
                .await
            {
                tracing::error!(error = %e, "Output observation listener unavailable");
            }

            // Bind the per-output queue before publishing so the first
            // message of a fresh output is not dropped by the exchange
            let spec = QueueSpec::output(&self.event_type, output.name());
            self.broker.declare(&spec).await?;
            self.broker
                .publish_json(&spec.exchange, output.name(), &message.to_json())
                .await?;

            tracing::debug!(
                message_id = %message.id,
                output = output.name(),
                exchange = %spec.exchange,
                "Message routed to output"
            );
            return Ok(());
        }
    }
}

#[async_trait]
impl Handler for MessageHandler {
    async fn handle(&self, _queue: &str, body: serde_json::Value) {
        let message = match Message::from_json(&body, &self.registry) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(event_type = %self.event_type, error = %e, "Malformed message");
                return;
            }
        };

        if let Err(e) = self.route(message).await {
            tracing::error!(event_type = %self.event_type, error = %e, "Failed to route message");
        }
    }
}
