//! Generation consumer
//!
//! A single consumer per worker that drains any number of tmp generation
//! queues into the durable `messages.<type>` exchanges. Queues idle for
//! longer than the cleanup timeout are cancelled and deleted by a monitor
//! loop, which bounds tmp queue lifetime without inter-worker coordination.

use crate::broker::{Broker, QueueSpec};
use crate::consumers::base::{ConsumeHandle, Handler, Runner};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default idle timeout before a tmp queue is garbage-collected
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Period of the idle-queue monitor
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Drains tmp generation queues into `messages.<type>`
pub struct GenerationConsumer {
    broker: Arc<dyn Broker>,
    runner: Runner,
    cleanup_timeout: Duration,
    handles: Arc<Mutex<HashMap<String, ConsumeHandle>>>,
    last_received: Arc<Mutex<HashMap<String, Instant>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GenerationConsumer {
    pub fn new(broker: Arc<dyn Broker>, cleanup_timeout: Duration) -> Self {
        Self {
            broker,
            runner: Runner::new("GenerationConsumer"),
            cleanup_timeout,
            handles: Arc::new(Mutex::new(HashMap::new())),
            last_received: Arc::new(Mutex::new(HashMap::new())),
            monitor: Mutex::new(None),
        }
    }

    /// Start the task reaper and the idle-queue monitor
    pub async fn start(&self) {
        self.runner.start_monitor().await;

        let broker = Arc::clone(&self.broker);
        let handles = Arc::clone(&self.handles);
        let last_received = Arc::clone(&self.last_received);
        let cleanup_timeout = self.cleanup_timeout;
        let mut running_rx = self.runner.running_rx();

        let monitor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = running_rx.changed() => break,
                    _ = tokio::time::sleep(MONITOR_INTERVAL) => {
                        collect_idle(&broker, &handles, &last_received, cleanup_timeout).await;
                    }
                }
            }
        });
        *self.monitor.lock().await = Some(monitor);

        tracing::info!("Generation consumer started");
    }

    /// Start consuming a tmp generation queue announced on the cluster bus
    ///
    /// A duplicate announcement for a queue already being consumed is a
    /// no-op.
    pub async fn consume(&self, queue_name: &str) -> Result<()> {
        {
            let handles = self.handles.lock().await;
            if handles.contains_key(queue_name) {
                tracing::debug!(queue = queue_name, "Already consuming, skipping");
                return Ok(());
            }
        }

        // Re-declare so workers that did not create the queue can consume it
        let spec = QueueSpec::generation_named(queue_name);
        self.broker.declare(&spec).await?;
        let consumer = self.broker.consume(queue_name).await?;

        let handler = Arc::new(GenerationHandler {
            broker: Arc::clone(&self.broker),
            last_received: Arc::clone(&self.last_received),
        });
        let handle = self
            .runner
            .spawn_consume(Arc::clone(&self.broker), consumer, handler);

        self.handles
            .lock()
            .await
            .insert(queue_name.to_string(), handle);
        self.last_received
            .lock()
            .await
            .insert(queue_name.to_string(), Instant::now());

        tracing::debug!(queue = queue_name, "Consuming generation queue");
        Ok(())
    }

    /// Cancel consumption of a tmp queue and delete it
    pub async fn cancel(&self, queue_name: &str) {
        cancel_queue(&self.broker, &self.handles, &self.last_received, queue_name).await;
    }

    /// Queues currently being consumed
    pub async fn consumed_queues(&self) -> Vec<String> {
        self.handles.lock().await.keys().cloned().collect()
    }

    pub async fn stop(&self) {
        let handles: Vec<ConsumeHandle> = {
            let mut map = self.handles.lock().await;
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.cancel().await;
        }

        self.runner.stop().await;

        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.await;
        }
    }
}

/// Cancel one tmp queue: stop its consumption loop, forget its timestamps,
/// and delete the queue
async fn cancel_queue(
    broker: &Arc<dyn Broker>,
    handles: &Arc<Mutex<HashMap<String, ConsumeHandle>>>,
    last_received: &Arc<Mutex<HashMap<String, Instant>>>,
    queue_name: &str,
) {
    let handle = handles.lock().await.remove(queue_name);
    if let Some(handle) = handle {
        handle.cancel().await;
    }
    last_received.lock().await.remove(queue_name);

    if let Err(e) = broker.delete_queue(queue_name).await {
        tracing::debug!(queue = queue_name, error = %e, "Tmp queue delete failed");
    }
}

/// One monitor pass: cancel every queue idle past the cleanup timeout
async fn collect_idle(
    broker: &Arc<dyn Broker>,
    handles: &Arc<Mutex<HashMap<String, ConsumeHandle>>>,
    last_received: &Arc<Mutex<HashMap<String, Instant>>>,
    cleanup_timeout: Duration,
) {
    let now = Instant::now();
    let idle: Vec<String> = {
        let last_received = last_received.lock().await;
        last_received
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > cleanup_timeout)
            .map(|(queue, _)| queue.clone())
            .collect()
    };

    for queue in idle {
        tracing::debug!(
            queue = %queue,
            timeout = ?cleanup_timeout,
            "Empty, cancel by generation monitoring"
        );
        cancel_queue(broker, handles, last_received, &queue).await;
    }
}

struct GenerationHandler {
    broker: Arc<dyn Broker>,
    last_received: Arc<Mutex<HashMap<String, Instant>>>,
}

#[async_trait]
impl Handler for GenerationHandler {
    async fn handle(&self, queue: &str, body: serde_json::Value) {
        {
            let mut last_received = self.last_received.lock().await;
            if let Some(last) = last_received.get_mut(queue) {
                *last = Instant::now();
            }
        }

        // Republished verbatim; only the event type is needed for routing
        let Some(event_type) = body.get("event_type").and_then(|t| t.as_str()) else {
            tracing::error!(queue = queue, "Generated message without event_type");
            return;
        };

        let exchange = format!("messages.{event_type}");
        match self.broker.publish_json(&exchange, event_type, &body).await {
            Ok(()) => tracing::debug!(
                queue = queue,
                exchange = %exchange,
                "Generated message passed to messages exchange"
            ),
            Err(e) => tracing::error!(
                queue = queue,
                exchange = %exchange,
                error = %e,
                "Failed to forward generated message"
            ),
        }
    }
}
