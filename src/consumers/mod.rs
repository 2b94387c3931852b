//! Consumer roles
//!
//! Five cooperating roles wired by typed queues: Event, Generation,
//! Message, Output, and the manager that supervises them. The cluster bus
//! lives in [`crate::cluster`].

pub(crate) mod base;
pub mod event;
pub mod generation;
pub mod manager;
pub mod message;
pub mod output;

pub use event::EventConsumer;
pub use generation::{GenerationConsumer, DEFAULT_CLEANUP_TIMEOUT};
pub use manager::ConsumersManager;
pub use message::MessageConsumer;
pub use output::OutputConsumer;
