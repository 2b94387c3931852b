//! Consumers manager
//!
//! Wires and supervises the whole consumer topology: the cluster bus, the
//! generation consumer, one event and one message consumer per configured
//! event type, and lazily-started output consumers. Cluster announcements
//! are forwarded into the generation consumer and into idempotent output
//! consumer startup.

use crate::broker::Broker;
use crate::cluster::{Cluster, ClusterHandlers};
use crate::config::{Config, Registry};
use crate::consumers::event::EventConsumer;
use crate::consumers::generation::{GenerationConsumer, DEFAULT_CLEANUP_TIMEOUT};
use crate::consumers::message::MessageConsumer;
use crate::consumers::output::OutputConsumer;
use crate::error::Result;
use crate::outputs::OutputSpec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// Container for all worker consumers
pub struct ConsumersManager {
    config: Config,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,

    cluster: Option<Arc<Cluster>>,
    generation: Option<Arc<GenerationConsumer>>,
    event_consumers: HashMap<String, EventConsumer>,
    message_consumers: HashMap<String, MessageConsumer>,
    output_consumers: Arc<Mutex<HashMap<(String, String), OutputConsumer>>>,
    listeners: Vec<JoinHandle<()>>,
}

impl ConsumersManager {
    pub fn new(config: Config, registry: Arc<Registry>, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            registry,
            broker,
            cluster: None,
            generation: None,
            event_consumers: HashMap::new(),
            message_consumers: HashMap::new(),
            output_consumers: Arc::new(Mutex::new(HashMap::new())),
            listeners: Vec::new(),
        }
    }

    /// Start the cluster, the generation consumer, per-type consumers,
    /// and the configured output consumers
    pub async fn start_all(&mut self) -> Result<()> {
        let (start_consume_tx, start_consume_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cluster_observed_tx, cluster_observed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (local_observed_tx, local_observed_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut cluster = Cluster::new(
            Arc::clone(&self.broker),
            ClusterHandlers {
                start_consume: start_consume_tx,
                output_observed: cluster_observed_tx,
            },
        );
        cluster.start().await?;
        let cluster = Arc::new(cluster);
        self.cluster = Some(Arc::clone(&cluster));

        let generation = Arc::new(GenerationConsumer::new(
            Arc::clone(&self.broker),
            DEFAULT_CLEANUP_TIMEOUT,
        ));
        generation.start().await;
        self.generation = Some(Arc::clone(&generation));

        let generation_listener = self.listen_generation(start_consume_rx, generation);
        let cluster_listener = self.listen_cluster_observations(cluster_observed_rx);
        let local_listener =
            self.listen_local_observations(local_observed_rx, Arc::clone(&cluster));
        self.listeners.push(generation_listener);
        self.listeners.push(cluster_listener);
        self.listeners.push(local_listener);

        for event_type in self.config.event_types() {
            let event_consumer = EventConsumer::start(
                event_type.clone(),
                self.config.event_pipeline(&event_type, &self.registry)?,
                self.config.generators(&event_type, &self.registry)?,
                Arc::clone(&self.broker),
                Arc::clone(&cluster),
            )
            .await?;
            self.event_consumers.insert(event_type.clone(), event_consumer);

            let message_consumer = MessageConsumer::start(
                event_type.clone(),
                self.config.router(&event_type, &self.registry)?,
                Arc::new(self.registry.outputs.clone()),
                self.config.enabled_outputs(&event_type)?,
                local_observed_tx.clone(),
                Arc::clone(&self.broker),
            )
            .await?;
            self.message_consumers
                .insert(event_type.clone(), message_consumer);

            // Pre-start consumers for the outputs this worker serves
            if let Some(enabled) = self.config.enabled_outputs(&event_type)? {
                for output in enabled {
                    self.start_output_consumer(&event_type, &OutputSpec::named(output))
                        .await?;
                }
            }
        }

        tracing::info!(
            event_types = ?self.config.event_types(),
            "All consumers started"
        );
        Ok(())
    }

    /// Start an output consumer for `(event_type, output)`
    ///
    /// A duplicate start is a no-op, so cluster-wide announcements can be
    /// applied blindly.
    pub async fn start_output_consumer(
        &self,
        event_type: &str,
        spec: &OutputSpec,
    ) -> Result<()> {
        let output = self.registry.outputs.build(spec)?;
        let key = (event_type.to_string(), output.name().to_string());

        let mut consumers = self.output_consumers.lock().await;
        if consumers.contains_key(&key) {
            tracing::debug!(
                event_type = event_type,
                output = output.name(),
                "Output consumer already running"
            );
            return Ok(());
        }

        let router = self.config.router(event_type, &self.registry)?;
        let consumer = OutputConsumer::start(
            event_type,
            output.name(),
            router,
            Arc::new(self.registry.outputs.clone()),
            Arc::clone(&self.broker),
        )
        .await?;
        consumers.insert(key, consumer);
        Ok(())
    }

    /// Forward announced tmp queues into the generation consumer
    fn listen_generation(
        &self,
        mut rx: mpsc::Receiver<String>,
        generation: Arc<GenerationConsumer>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(queue_name) = rx.recv().await {
                tracing::debug!(queue = %queue_name, "Generation queue announced");
                if let Err(e) = generation.consume(&queue_name).await {
                    tracing::error!(queue = %queue_name, error = %e, "Cannot consume generation queue");
                }
            }
        })
    }

    /// Apply output observations broadcast by other workers
    fn listen_cluster_observations(
        &self,
        mut rx: mpsc::Receiver<(String, serde_json::Value)>,
    ) -> JoinHandle<()> {
        let manager = self.observer();
        tokio::spawn(async move {
            while let Some((event_type, output)) = rx.recv().await {
                let spec = match OutputSpec::from_wire(&output) {
                    Ok(spec) => spec,
                    Err(e) => {
                        tracing::error!(error = %e, "Invalid output in cluster observation");
                        continue;
                    }
                };
                manager.start(&event_type, &spec).await;
            }
        })
    }

    /// Apply output observations from local message consumers and
    /// broadcast them to the cluster
    fn listen_local_observations(
        &self,
        mut rx: mpsc::Receiver<(String, OutputSpec)>,
        cluster: Arc<Cluster>,
    ) -> JoinHandle<()> {
        let manager = self.observer();
        tokio::spawn(async move {
            while let Some((event_type, spec)) = rx.recv().await {
                tracing::debug!(event_type = %event_type, output = %spec.path, "New output observed");
                manager.start(&event_type, &spec).await;
                if let Err(e) = cluster.output_observed(&event_type, &spec).await {
                    tracing::error!(error = %e, "Cannot announce observed output");
                }
            }
        })
    }

    fn observer(&self) -> ObservedOutputs {
        ObservedOutputs {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            broker: Arc::clone(&self.broker),
            output_consumers: Arc::clone(&self.output_consumers),
        }
    }

    /// Names of running output consumers, as `(event_type, output)` pairs
    pub async fn running_output_consumers(&self) -> Vec<(String, String)> {
        self.output_consumers.lock().await.keys().cloned().collect()
    }

    /// Stop everything in reverse dependency order, the cluster last
    pub async fn stop_all(&mut self) {
        for consumer in self.event_consumers.values() {
            consumer.stop().await;
        }
        self.event_consumers.clear();

        for consumer in self.message_consumers.values() {
            consumer.stop().await;
        }
        self.message_consumers.clear();

        {
            let mut consumers = self.output_consumers.lock().await;
            for (_, consumer) in consumers.drain() {
                consumer.stop().await;
            }
        }

        if let Some(generation) = self.generation.take() {
            generation.stop().await;
        }

        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        if let Some(cluster) = self.cluster.take() {
            cluster.stop().await;
        }

        tracing::info!("All consumers stopped");
    }
}

/// The shared state needed to start output consumers from listener tasks
struct ObservedOutputs {
    config: Config,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    output_consumers: Arc<Mutex<HashMap<(String, String), OutputConsumer>>>,
}

impl ObservedOutputs {
    async fn start(&self, event_type: &str, spec: &OutputSpec) {
        let output = match self.registry.outputs.build(spec) {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Unknown observed output");
                return;
            }
        };
        let key = (event_type.to_string(), output.name().to_string());

        let mut consumers = self.output_consumers.lock().await;
        if consumers.contains_key(&key) {
            return;
        }

        let router = match self.config.router(event_type, &self.registry) {
            Ok(router) => router,
            Err(e) => {
                tracing::warn!(
                    event_type = event_type,
                    error = %e,
                    "Observed output for unconfigured event type"
                );
                return;
            }
        };

        match OutputConsumer::start(
            event_type,
            output.name(),
            router,
            Arc::new(self.registry.outputs.clone()),
            Arc::clone(&self.broker),
        )
        .await
        {
            Ok(consumer) => {
                consumers.insert(key, consumer);
            }
            Err(e) => tracing::error!(
                event_type = event_type,
                output = output.name(),
                error = %e,
                "Cannot start output consumer"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;

    fn test_config() -> Config {
        Config::from_str(
            r#"
events:
  example_event:
    generators:
      - name: count
        kwargs: {count: 2}
    output: ["null", console]
"#,
        )
        .expect("valid test config")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_all_wires_topology() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = ConsumersManager::new(
            test_config(),
            Arc::new(Registry::with_builtins()),
            broker.clone(),
        );

        manager.start_all().await.unwrap();

        assert!(broker.has_queue("events.example_event"));
        assert!(broker.has_queue("messages.example_event"));
        assert!(broker.has_queue("output.example_event"));
        assert!(broker
            .queue_names()
            .iter()
            .any(|q| q.starts_with("cluster.node.")));

        // Configured outputs are pre-started
        let running = manager.running_output_consumers().await;
        assert_eq!(running.len(), 2);

        manager.stop_all().await;
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_output_consumer_start_is_noop() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = ConsumersManager::new(
            test_config(),
            Arc::new(Registry::with_builtins()),
            broker.clone(),
        );
        manager.start_all().await.unwrap();

        manager
            .start_output_consumer("example_event", &OutputSpec::named("null"))
            .await
            .unwrap();
        manager
            .start_output_consumer("example_event", &OutputSpec::named("null"))
            .await
            .unwrap();
        assert_eq!(manager.running_output_consumers().await.len(), 2);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_cluster_observation_starts_output_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = ConsumersManager::new(
            Config::from_str("events: {example_event: {output: fallback}}")
                .expect("valid test config"),
            Arc::new(Registry::with_builtins()),
            broker.clone(),
        );
        manager.start_all().await.unwrap();
        assert!(manager.running_output_consumers().await.is_empty());

        // Another worker announces it saw the "never" output in use
        broker
            .publish_json(
                "cluster",
                "",
                &serde_json::json!({
                    "action": "output_observed",
                    "event_type": "example_event",
                    "output": ["never", [], {}],
                }),
            )
            .await
            .unwrap();

        let manager_ref = &manager;
        for _ in 0..300 {
            if manager_ref.running_output_consumers().await.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let running = manager.running_output_consumers().await;
        assert_eq!(
            running,
            vec![("example_event".to_string(), "never".to_string())]
        );

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_announced_generation_queue_is_consumed() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = ConsumersManager::new(
            test_config(),
            Arc::new(Registry::with_builtins()),
            broker.clone(),
        );
        manager.start_all().await.unwrap();

        let spec = crate::broker::QueueSpec::generation("example_event");
        broker.declare(&spec).await.unwrap();
        broker
            .publish_json(
                "cluster",
                "",
                &serde_json::json!({"action": "start_consume", "queue_name": spec.name}),
            )
            .await
            .unwrap();

        let message = crate::message::Message::new("m1", "example_event");
        broker
            .publish("", &spec.name, message.to_bytes())
            .await
            .unwrap();

        // The generation consumer drains the tmp queue into messages.*,
        // and the pipeline runs it to completion from there
        let broker_check = broker.clone();
        wait_for(move || broker_check.queue_depth(&spec.name) == 0).await;

        manager.stop_all().await;
    }
}
