//! Application wiring
//!
//! [`CourierApp`] owns the broker connection and the consumers manager.
//! A worker process builds one from configuration, starts it, and stops
//! it on shutdown; the `send` helper publishes test events.

use crate::broker::{Broker, QueueSpec, RabbitBroker};
use crate::config::{Config, Registry};
use crate::consumers::ConsumersManager;
use crate::error::{CourierError, Result};
use crate::event::Event;
use std::sync::Arc;

/// A courier worker node
pub struct CourierApp {
    config: Config,
    registry: Arc<Registry>,
    broker: Option<Arc<dyn Broker>>,
    manager: Option<ConsumersManager>,
}

impl CourierApp {
    /// Application over a parsed configuration and component registry
    pub fn new(config: Config, registry: Registry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            broker: None,
            manager: None,
        }
    }

    /// Application from a YAML configuration file, with the built-in
    /// component registry
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Config::from_file(path)?;
        Ok(Self::new(config, Registry::with_builtins()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to the configured broker and start all consumers
    pub async fn start(&mut self) -> Result<()> {
        let broker = RabbitBroker::connect(self.config.rabbit_config()?).await?;
        self.start_with_broker(Arc::new(broker)).await
    }

    /// Start all consumers on a provided broker
    ///
    /// Test harnesses pass an in-memory broker here.
    pub async fn start_with_broker(&mut self, broker: Arc<dyn Broker>) -> Result<()> {
        if self.manager.is_some() {
            return Err(CourierError::Config("application already started".to_string()));
        }
        tracing::info!(pid = std::process::id(), "Courier worker starting");

        let mut manager = ConsumersManager::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&broker),
        );
        manager.start_all().await?;

        self.broker = Some(broker);
        self.manager = Some(manager);
        Ok(())
    }

    /// Stop all consumers, then close the broker connection
    pub async fn stop(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            manager.stop_all().await;
        }
        if let Some(broker) = self.broker.take() {
            if let Err(e) = broker.close().await {
                tracing::warn!(error = %e, "Broker close failed");
            }
        }
        tracing::info!("Courier worker stopped");
    }

    /// Publish an event to the `events.<type>` queue
    ///
    /// Connects on demand when the worker side is not running.
    pub async fn send(&mut self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        if self.broker.is_none() {
            let broker = RabbitBroker::connect(self.config.rabbit_config()?).await?;
            self.broker = Some(Arc::new(broker));
        }
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| CourierError::Connection("no broker".to_string()))?;

        let event = Event::new(event_type, payload);
        let spec = QueueSpec::events(event_type);
        broker.declare(&spec).await?;
        broker
            .publish_json("", &spec.name, &serde_json::to_value(&event)?)
            .await?;

        tracing::debug!(event_id = %event.id, event_type = event_type, "Event published");
        Ok(())
    }

    /// Publish an event through an already-attached broker
    pub async fn send_with_broker(
        broker: &dyn Broker,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let event = Event::new(event_type, payload);
        let spec = QueueSpec::events(event_type);
        broker.declare(&spec).await?;
        broker
            .publish_json("", &spec.name, &serde_json::to_value(&event)?)
            .await
    }
}
