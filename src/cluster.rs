//! Cluster bus — the fanout control plane
//!
//! Every worker binds an auto-delete queue to the `cluster` fanout
//! exchange and publishes a small closed set of actions: tmp generation
//! queues ready to consume, and outputs newly observed in use. Handlers
//! are wired by the consumers manager; a handler failure is logged and
//! never propagates.

use crate::broker::{Broker, QueueSpec};
use crate::consumers::base::{Handler, Runner};
use crate::error::Result;
use crate::outputs::OutputSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The closed set of cluster control actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClusterAction {
    /// A tmp generation queue is populated and ready to be drained
    StartConsume { queue_name: String },
    /// Somewhere in the cluster a message wants this output
    OutputObserved {
        event_type: String,
        /// Serialized output spec: `[path, args, kwargs]`
        output: serde_json::Value,
    },
}

/// Channels the cluster dispatches received actions into
#[derive(Clone)]
pub struct ClusterHandlers {
    pub start_consume: mpsc::Sender<String>,
    pub output_observed: mpsc::Sender<(String, serde_json::Value)>,
}

/// This worker's connection to the cluster control plane
pub struct Cluster {
    broker: Arc<dyn Broker>,
    queue_name: String,
    runner: Runner,
    handlers: ClusterHandlers,
}

impl Cluster {
    pub fn new(broker: Arc<dyn Broker>, handlers: ClusterHandlers) -> Self {
        Self {
            broker,
            queue_name: String::new(),
            runner: Runner::new("Cluster"),
            handlers,
        }
    }

    /// This node's cluster queue name (empty before `start`)
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Declare the node queue and start dispatching cluster actions
    pub async fn start(&mut self) -> Result<()> {
        let spec = QueueSpec::cluster();
        self.broker.declare(&spec).await?;
        self.queue_name = spec.name.clone();

        self.runner.start_monitor().await;
        let consumer = self.broker.consume(&spec.name).await?;
        let handle = self.runner.spawn_consume(
            Arc::clone(&self.broker),
            consumer,
            Arc::new(Dispatch {
                handlers: self.handlers.clone(),
            }),
        );
        self.runner.track(handle).await;

        tracing::info!(queue = %spec.name, "Cluster bus joined");
        Ok(())
    }

    /// Stop dispatching; the auto-delete node queue goes away with its
    /// consumer
    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    /// Announce a populated tmp generation queue to every worker
    pub async fn start_consume(&self, queue_name: &str) -> Result<()> {
        self.publish(&ClusterAction::StartConsume {
            queue_name: queue_name.to_string(),
        })
        .await?;
        tracing::debug!(queue = queue_name, "Announced generation queue");
        Ok(())
    }

    /// Announce an observed `(event_type, output)` pair to every worker
    pub async fn output_observed(&self, event_type: &str, output: &OutputSpec) -> Result<()> {
        self.publish(&ClusterAction::OutputObserved {
            event_type: event_type.to_string(),
            output: output.to_wire(),
        })
        .await?;
        tracing::debug!(
            event_type = event_type,
            output = %output.path,
            "Announced observed output"
        );
        Ok(())
    }

    async fn publish(&self, action: &ClusterAction) -> Result<()> {
        let body = serde_json::to_value(action)?;
        self.broker.publish_json("cluster", "", &body).await
    }
}

struct Dispatch {
    handlers: ClusterHandlers,
}

#[async_trait]
impl Handler for Dispatch {
    async fn handle(&self, _queue: &str, body: serde_json::Value) {
        let action: ClusterAction = match serde_json::from_value(body.clone()) {
            Ok(action) => action,
            Err(e) => {
                tracing::error!(body = %body, error = %e, "Invalid cluster action");
                return;
            }
        };

        match action {
            ClusterAction::StartConsume { queue_name } => {
                if let Err(e) = self.handlers.start_consume.send(queue_name).await {
                    tracing::error!(error = %e, "start_consume handler unavailable");
                }
            }
            ClusterAction::OutputObserved { event_type, output } => {
                if let Err(e) = self
                    .handlers
                    .output_observed
                    .send((event_type, output))
                    .await
                {
                    tracing::error!(error = %e, "output_observed handler unavailable");
                }
            }
        }
    }
}
