//! Shared consumer machinery
//!
//! Every consumer role owns a [`Runner`]: a running flag, the set of
//! in-flight handler tasks, and a reaper that prunes completed handles.
//! Queue consumption runs in a dedicated task per queue which parses each
//! delivery, hands it to the role's [`Handler`], and acks once the handler
//! returns — errors are logged, never nacked.

use crate::broker::{Broker, BrokerConsumer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Period of the in-flight task reaper
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits for the reaper to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before resubscribing after a consumer error
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Per-role delivery handler
///
/// Receives the decoded JSON body and the queue it arrived on. Must not
/// panic; any failure is handled internally and logged.
#[async_trait]
pub(crate) trait Handler: Send + Sync + 'static {
    async fn handle(&self, queue: &str, body: serde_json::Value);
}

/// Handle on one queue-consumption task
pub(crate) struct ConsumeHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumeHandle {
    /// Stop consuming this queue and wait for the loop to finish
    pub async fn cancel(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Task bookkeeping shared by all consumer roles
pub(crate) struct Runner {
    name: &'static str,
    running_tx: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    consumes: Mutex<Vec<ConsumeHandle>>,
}

impl Runner {
    pub fn new(name: &'static str) -> Self {
        let (running_tx, _) = watch::channel(true);
        Self {
            name,
            running_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
            monitor: Mutex::new(None),
            consumes: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Watch the running flag (used by role-specific monitor loops)
    pub fn running_rx(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    /// Start the in-flight task reaper
    pub async fn start_monitor(&self) {
        let tasks = Arc::clone(&self.tasks);
        let mut running_rx = self.running_tx.subscribe();
        let monitor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = running_rx.changed() => break,
                    _ = tokio::time::sleep(REAP_INTERVAL) => {
                        tasks.lock().await.retain(|task| !task.is_finished());
                    }
                }
            }
        });
        *self.monitor.lock().await = Some(monitor);
    }

    /// Spawn the consumption loop for one queue
    ///
    /// On a consumer error the loop resubscribes through the broker after
    /// a delay, so a reconnected connection resumes consumption.
    pub fn spawn_consume(
        &self,
        broker: Arc<dyn Broker>,
        consumer: Box<dyn BrokerConsumer>,
        handler: Arc<dyn Handler>,
    ) -> ConsumeHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut running_rx = self.running_tx.subscribe();
        let tasks = Arc::clone(&self.tasks);
        let name = self.name;

        let loop_queue = consumer.queue().to_string();
        let task = tokio::spawn(async move {
            let mut consumer = consumer;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = running_rx.changed() => break,
                    next = consumer.next() => match next {
                        Ok(Some(delivery)) => {
                            let handler = Arc::clone(&handler);
                            let delivery_queue = loop_queue.clone();
                            let task = tokio::spawn(async move {
                                match serde_json::from_slice::<serde_json::Value>(delivery.body()) {
                                    Ok(body) => handler.handle(&delivery_queue, body).await,
                                    Err(e) => tracing::error!(
                                        consumer = name,
                                        queue = %delivery_queue,
                                        error = %e,
                                        "Malformed delivery body"
                                    ),
                                }
                                if let Err(e) = delivery.ack().await {
                                    tracing::error!(
                                        consumer = name,
                                        queue = %delivery_queue,
                                        error = %e,
                                        "Ack failed"
                                    );
                                }
                            });
                            tasks.lock().await.push(task);
                        }
                        Ok(None) => {
                            tracing::debug!(consumer = name, queue = %loop_queue, "Consumption ended");
                            return;
                        }
                        Err(e) => {
                            tracing::error!(
                                consumer = name,
                                queue = %loop_queue,
                                error = %e,
                                "Consumer error, resubscribing"
                            );
                            loop {
                                tokio::select! {
                                    _ = stop_rx.changed() => return,
                                    _ = running_rx.changed() => return,
                                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                                }
                                match broker.consume(&loop_queue).await {
                                    Ok(resumed) => {
                                        tracing::info!(
                                            consumer = name,
                                            queue = %loop_queue,
                                            "Consumption resumed"
                                        );
                                        consumer = resumed;
                                        break;
                                    }
                                    Err(e) => tracing::warn!(
                                        consumer = name,
                                        queue = %loop_queue,
                                        error = %e,
                                        "Resubscribe failed"
                                    ),
                                }
                            }
                        }
                    }
                }
            }
            if let Err(e) = consumer.cancel().await {
                tracing::debug!(consumer = name, queue = %loop_queue, error = %e, "Cancel failed");
            }
        });

        ConsumeHandle { stop_tx, task }
    }

    /// Track a consume handle for cancellation on `stop`
    pub async fn track(&self, handle: ConsumeHandle) {
        self.consumes.lock().await.push(handle);
    }

    /// Graceful shutdown: flip the running flag, cancel consumption on all
    /// tracked queues, wait for the reaper, then let outstanding handler
    /// tasks complete
    pub async fn stop(&self) {
        let _ = self.running_tx.send(false);
        tracing::info!(consumer = self.name, "Stop consumer");

        let handles: Vec<ConsumeHandle> = self.consumes.lock().await.drain(..).collect();
        for handle in handles {
            handle.cancel().await;
        }

        if let Some(monitor) = self.monitor.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, monitor).await.is_err() {
                tracing::warn!(consumer = self.name, "Monitor did not stop in time");
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        tracing::info!(consumer = self.name, "Consumer stopped");
    }
}
