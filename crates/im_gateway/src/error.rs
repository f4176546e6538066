//! Gateway error types.

use membership_store::StoreError;
use thiserror::Error;

/// Errors from channel and message routing.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No roster exists under this channel name.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// A key with this channel name already exists.
    #[error("Channel already exists: {0}")]
    DuplicateChannel(String),

    /// The identity is not on the channel roster.
    #[error("{identity} is not a member of {channel}")]
    NotAMember { channel: String, identity: String },

    /// A required field is missing or empty.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Membership store unavailable or timed out.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection I/O failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Routing failure.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Identity endpoint could not be reached or activated.
    #[error("Endpoint activation failed for {0}")]
    Activation(String),

    /// Fanout bus failure.
    #[error("Bus error: {0}")]
    Bus(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
