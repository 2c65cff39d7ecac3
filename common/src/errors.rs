// Error handling framework for the jobber supervisor

use std::path::PathBuf;
use thiserror::Error;

/// Broker-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Broker has not connected")]
    NotConnected,

    #[error("Failed to open channel: {0}")]
    ChannelOpen(String),

    #[error("Failed to declare {entity} '{name}': {reason}")]
    Declaration {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("Failed to consume queue '{queue}': {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors raised while discovering and parsing jobber definition files
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Jobber config path is empty")]
    IncludeUnset,

    #[error("Invalid include pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid jobber definition in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// HTTP forward errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Target responded with status {status}")]
    Status { status: u16, body: String },

    #[error("Forward panicked: {0}")]
    Panicked(String),
}

impl ForwardError {
    /// HTTP status recorded in the delivery log, 0 when no response was received
    pub fn http_code(&self) -> u16 {
        match self {
            ForwardError::Status { status, .. } => *status,
            _ => 0,
        }
    }
}

/// Control errors returned by jobber and registry operations
#[derive(Error, Debug)]
pub enum MqError {
    #[error("Not found jobber {0}")]
    NotFound(String),

    #[error("Jobber {0} has started")]
    AlreadyRunning(String),

    #[error("Jobber {0} already exists")]
    AlreadyExists(String),

    #[error("Jobber {name} failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: QueueError,
    },

    #[error("{} jobber(s) failed: {}", .0.len(), .0.join("; "))]
    Partial(Vec<String>),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}
