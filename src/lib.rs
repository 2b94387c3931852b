//! # courier
//!
//! Distributed asynchronous messaging: fan inbound events out into
//! per-recipient messages and drive each one through a declarative
//! delivery pipeline of output backends, coordinated over an AMQP-style
//! broker.
//!
//! ## Overview
//!
//! A worker node runs five cooperating consumer roles wired by typed
//! queues. Inbound events (`events.<type>`) pass through an event
//! pipeline and fan out via generators into an ephemeral generation
//! queue. The generation consumer drains those queues into the durable
//! `messages.<type>` queue, where the message consumer picks the next
//! pipeline step and routes each message to its output queue. Output
//! consumers invoke the backends, update the per-message route state, and
//! requeue the message while steps remain. A fanout cluster bus announces
//! new generation queues and newly observed outputs to every worker.
//!
//! ## Quick Start
//!
//! ```rust
//! use courier::{Config, CourierApp, MemoryBroker, Registry};
//! use std::sync::Arc;
//!
//! # async fn example() -> courier::Result<()> {
//! let config = Config::from_str(
//!     r#"
//! events:
//!   example_event:
//!     generators: [count]
//!     output: [console]
//! "#,
//! )?;
//!
//! let mut app = CourierApp::new(config, Registry::with_builtins());
//! app.start_with_broker(Arc::new(MemoryBroker::new())).await?;
//!
//! // Publish a test event and let the pipeline deliver it
//! # app.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Broker** trait — transport seam; RabbitMQ (lapin) and in-memory
//!   implementations
//! - **Effect / Router** — the pure delivery-pipeline state machine
//! - **Consumers** — Event, Generation, Message, Output roles plus the
//!   manager that supervises them
//! - **Cluster** — fanout control plane between worker processes
//! - **Registry** — explicit name-to-constructor maps for outputs,
//!   filters, generators, and pipelines

pub mod app;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod consumers;
pub mod effects;
pub mod error;
pub mod event;
pub mod message;
pub mod outputs;
pub mod pipeline;
pub mod router;

// Re-export core types
pub use app::CourierApp;
pub use broker::{Broker, BrokerConsumer, Delivery, ExchangeKind, MemoryBroker, QueueSpec,
    RabbitBroker, RabbitConfig};
pub use cluster::{Cluster, ClusterAction, ClusterHandlers};
pub use config::{Config, Registry};
pub use consumers::{
    ConsumersManager, EventConsumer, GenerationConsumer, MessageConsumer, OutputConsumer,
};
pub use effects::{send, Action, Effect, OutputStatus, SendEffect};
pub use error::{CourierError, Result};
pub use event::Event;
pub use message::{EffectStatus, Message, Route};
pub use outputs::{OutputBackend, OutputRegistry, OutputSpec, SendError};
pub use pipeline::{
    EventFilter, EventPipeline, FilterError, GenerationPipeline, GenerationSink, Generator,
};
pub use router::{PipelineFn, Router};
