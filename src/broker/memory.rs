//! In-memory broker for testing and single-process use
//!
//! Implements the full [`Broker`] contract — exchanges, bindings, explicit
//! ack, auto-delete — against process-local queues, so the consumer stack
//! can be exercised without a running RabbitMQ.

use super::{Broker, BrokerConsumer, Delivery, ExchangeKind, QueueSpec};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone)]
struct Binding {
    routing_key: String,
    queue: String,
}

struct QueueState {
    spec: QueueSpec,
    messages: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    deleted: AtomicBool,
    consumers: AtomicUsize,
}

struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Arc<QueueState>>,
}

struct Inner {
    state: Mutex<State>,
    published: Mutex<HashMap<String, usize>>,
    unacked: AtomicUsize,
    closed: AtomicBool,
}

/// In-memory broker
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    exchanges: HashMap::new(),
                    bindings: HashMap::new(),
                    queues: HashMap::new(),
                }),
                published: Mutex::new(HashMap::new()),
                unacked: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Total messages ever routed into a queue
    pub fn published_to(&self, name: &str) -> usize {
        self.inner
            .published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of deliveries handed out but not yet acked
    pub fn unacked(&self) -> usize {
        self.inner.unacked.load(Ordering::SeqCst)
    }

    /// Whether a queue currently exists
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queues
            .contains_key(name)
    }

    /// Number of messages waiting in a queue
    pub fn queue_depth(&self, name: &str) -> usize {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .queues
            .get(name)
            .map(|q| q.messages.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Names of all existing queues
    pub fn queue_names(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queues
            .keys()
            .cloned()
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CourierError::Connection("broker closed".to_string()));
        }
        Ok(())
    }

    fn remove_queue(inner: &Inner, name: &str) {
        let queue = {
            let mut state = inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for bindings in state.bindings.values_mut() {
                bindings.retain(|b| b.queue != name);
            }
            state.queues.remove(name)
        };
        if let Some(queue) = queue {
            queue.deleted.store(true, Ordering::SeqCst);
            queue.notify.notify_waiters();
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        if exchange.is_empty() {
            return Ok(());
        }
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.exchanges.insert(exchange.to_string(), kind);
        Ok(())
    }

    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !spec.exchange.is_empty() {
            state
                .exchanges
                .insert(spec.exchange.clone(), spec.exchange_kind);
        }

        state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    spec: spec.clone(),
                    messages: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    deleted: AtomicBool::new(false),
                    consumers: AtomicUsize::new(0),
                })
            });

        if !spec.exchange.is_empty() {
            let bindings = state.bindings.entry(spec.exchange.clone()).or_default();
            let exists = bindings
                .iter()
                .any(|b| b.queue == spec.name && b.routing_key == spec.routing_key);
            if !exists {
                bindings.push(Binding {
                    routing_key: spec.routing_key.clone(),
                    queue: spec.name.clone(),
                });
            }
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let targets: Vec<Arc<QueueState>> = {
            let state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if exchange.is_empty() {
                state.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let Some(kind) = state.exchanges.get(exchange).copied() else {
                    return Err(CourierError::Publish {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        reason: "no such exchange".to_string(),
                    });
                };
                state
                    .bindings
                    .get(exchange)
                    .map(|bindings| {
                        bindings
                            .iter()
                            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                            .filter_map(|b| state.queues.get(&b.queue).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };

        if targets.is_empty() {
            tracing::debug!(
                exchange = exchange,
                routing_key = routing_key,
                "Unroutable publish dropped"
            );
            return Ok(());
        }

        for queue in targets {
            queue
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push_back(body.clone());
            *self
                .inner
                .published
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(queue.spec.name.clone())
                .or_insert(0) += 1;
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn BrokerConsumer>> {
        self.ensure_open()?;
        let queue_state = {
            let state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.queues.get(queue).cloned()
        }
        .ok_or_else(|| CourierError::Consume {
            queue: queue.to_string(),
            reason: "no such queue".to_string(),
        })?;

        queue_state.consumers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConsumer {
            name: queue.to_string(),
            queue: queue_state,
            inner: Arc::clone(&self.inner),
            cancelled: false,
        }))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        Self::remove_queue(&self.inner, queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let queues: Vec<Arc<QueueState>> = {
            let state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.queues.values().cloned().collect()
        };
        for queue in queues {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryConsumer {
    name: String,
    queue: Arc<QueueState>,
    inner: Arc<Inner>,
    cancelled: bool,
}

impl MemoryConsumer {
    fn release(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.queue.spec.auto_delete {
            MemoryBroker::remove_queue(&self.inner, &self.name);
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn queue(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if self.cancelled
                || self.queue.deleted.load(Ordering::SeqCst)
                || self.inner.closed.load(Ordering::SeqCst)
            {
                return Ok(None);
            }

            // Register for a wakeup before checking, so a concurrent push
            // is never missed
            let notified = self.queue.notify.notified();

            let body = self
                .queue
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front();

            if let Some(body) = body {
                self.inner.unacked.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&self.inner);
                return Ok(Some(Delivery::new(body, move || {
                    Box::pin(async move {
                        inner.unacked.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                })));
            }

            notified.await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}
