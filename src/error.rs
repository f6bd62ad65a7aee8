//! Error types for the broker and its client libraries
//!
//! Malformed wire messages are not errors: the codec turns them into
//! `Message::Unknown` and the broker drops them. The types here cover
//! transport, configuration and registration failures.

use thiserror::Error;

/// Errors raised by the broker, the transport layer and configuration loading
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O error on a socket or file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `poll(2)` failed
    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    /// Endpoint string is not `tcp://host:port` or `ipc:///path`
    #[error("invalid endpoint '{0}' (expected tcp://host:port or ipc:///path)")]
    InvalidEndpoint(String),

    /// User services may not use the `mmi.` management prefix
    #[error("service name '{0}' uses the reserved 'mmi.' prefix")]
    ReservedServiceName(String),

    /// An internal service with this name is already registered
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    /// Configuration value could not be parsed or is out of range
    #[error("invalid configuration for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

/// Errors raised by the client and worker libraries
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection to the broker failed
    #[error("failed to connect to broker at {endpoint}: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Endpoint string is not valid
    #[error(transparent)]
    InvalidEndpoint(#[from] BrokerError),

    /// The worker lost its broker connection and has not reconnected yet
    #[error("not connected to a broker")]
    NotConnected,

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
