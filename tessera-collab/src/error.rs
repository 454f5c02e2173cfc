//! Error types for the realtime layer.
//!
//! Transport failures never reach the caller of `subscribe`; they surface as
//! `ConnectionStatus::Error` on the event bus. `RealtimeError` is reserved for
//! programmer errors such as nil identifiers or invalid configuration.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned synchronously by the channel manager.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Invalid project id: {0}")]
    InvalidProject(Uuid),
    #[error("Invalid actor id: {0}")]
    InvalidActor(Uuid),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration parse/validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors raised by a channel transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open channel '{channel}': {reason}")]
    Open { channel: String, reason: String },
    #[error("Subscription rejected: {0}")]
    Subscribe(String),
    #[error("Channel closed")]
    Closed,
    #[error("Transport timeout")]
    Timeout,
    #[error("Transport unreachable")]
    Unreachable,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}
