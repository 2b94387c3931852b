//! Broker abstraction — the transport seam of the messaging core
//!
//! All broker backends (RabbitMQ, in-memory, …) implement [`Broker`] to
//! provide a uniform API for declaring topology, publishing, and consuming
//! with explicit acknowledgement. The consumers never talk to a concrete
//! driver; a test harness substitutes the in-memory implementation.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod memory;
pub mod rabbitmq;

pub use memory::MemoryBroker;
pub use rabbitmq::{RabbitBroker, RabbitConfig};

/// Exchange routing behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by exact routing-key match
    Direct,
    /// Route to every bound queue, routing key ignored
    Fanout,
}

/// Declarative description of a queue, its exchange, and their binding
///
/// An empty exchange name means the default exchange, which routes by
/// queue name and needs no declaration or binding.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable inbound event queue: `events.<type>` on the default exchange
    pub fn events(event_type: &str) -> Self {
        let name = format!("events.{event_type}");
        Self {
            routing_key: name.clone(),
            name,
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    /// Fresh ephemeral generation queue: `gen.<type>.<uuid>`, auto-deleted
    pub fn generation(event_type: &str) -> Self {
        Self::generation_named(format!(
            "gen.{event_type}.{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Generation queue with a known name (re-declared by the worker that
    /// picks it up off the cluster bus)
    pub fn generation_named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            routing_key: name.clone(),
            name,
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: true,
        }
    }

    /// Durable pipeline queue: `messages.<type>` bound to the direct
    /// exchange of the same name with routing key `<type>`
    pub fn messages(event_type: &str) -> Self {
        Self {
            name: format!("messages.{event_type}"),
            exchange: format!("messages.{event_type}"),
            exchange_kind: ExchangeKind::Direct,
            routing_key: event_type.to_string(),
            durable: true,
            auto_delete: false,
        }
    }

    /// Durable output queue: `output.<type>` bound to the direct exchange
    /// of the same name with the output name as routing key
    pub fn output(event_type: &str, output_name: &str) -> Self {
        Self {
            name: format!("output.{event_type}"),
            exchange: format!("output.{event_type}"),
            exchange_kind: ExchangeKind::Direct,
            routing_key: output_name.to_string(),
            durable: true,
            auto_delete: false,
        }
    }

    /// Per-worker cluster queue: `cluster.node.<uuid>` bound to the
    /// `cluster` fanout exchange, auto-deleted
    pub fn cluster() -> Self {
        Self {
            name: format!("cluster.node.{}", uuid::Uuid::new_v4().simple()),
            exchange: "cluster".to_string(),
            exchange_kind: ExchangeKind::Fanout,
            routing_key: String::new(),
            durable: false,
            auto_delete: true,
        }
    }
}

/// A delivery pending acknowledgement
///
/// Deliveries are never nacked: errors are logged and acked, with retry
/// encoded in route state rather than broker redelivery.
pub struct Delivery {
    body: Vec<u8>,
    ack_fn: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl Delivery {
    /// Create a delivery with an ack callback
    pub fn new(
        body: Vec<u8>,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            body,
            ack_fn: Box::new(ack_fn),
        }
    }

    /// Message body (UTF-8 JSON)
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Acknowledge the delivery
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }
}

/// Active consumption of one queue
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Queue being consumed
    fn queue(&self) -> &str;

    /// Receive the next delivery; `None` once consumption is cancelled or
    /// the queue is deleted
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Cancel consumption (unconsumed deliveries stay with the broker)
    async fn cancel(&mut self) -> Result<()>;
}

/// Core trait for broker backends
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare the queue, its exchange, and their binding
    async fn declare(&self, spec: &QueueSpec) -> Result<()>;

    /// Publish a body to an exchange with a routing key
    ///
    /// The empty exchange routes directly to the queue named by the
    /// routing key.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Start consuming a queue
    async fn consume(&self, queue: &str) -> Result<Box<dyn BrokerConsumer>>;

    /// Delete a queue and its bindings
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Publish a JSON value (`content_type = application/json`)
    async fn publish_json(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        self.publish(exchange, routing_key, body.to_string().into_bytes())
            .await
    }
}
