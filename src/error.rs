//! Error types for courier

use thiserror::Error;

/// Errors that can occur in the messaging core
#[derive(Debug, Error)]
pub enum CourierError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Publish failure
    #[error("Failed to publish to exchange '{exchange}' (routing key '{routing_key}'): {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Queue or exchange declaration failure
    #[error("Failed to declare queue '{queue}': {reason}")]
    Declare {
        queue: String,
        reason: String,
    },

    /// Consume failure
    #[error("Failed to consume queue '{queue}': {reason}")]
    Consume {
        queue: String,
        reason: String,
    },

    /// Acknowledgement failure
    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    /// Queue management error (delete, cancel)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed wire payload (schema-level, not JSON-level)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing failure
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Output backend not present in the registry
    #[error("Unknown output backend: {0}")]
    UnknownOutput(String),

    /// Effect name not present in the registry
    #[error("Unknown effect: {0}")]
    UnknownEffect(String),

    /// Pipeline path not present in the registry
    #[error("Unknown output pipeline: {0}")]
    UnknownPipeline(String),

    /// Event filter or generator not present in the registry
    #[error("Unknown pipeline component: {0}")]
    UnknownComponent(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, CourierError>;
