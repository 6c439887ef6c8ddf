//! Error types for tunproxy
//!
//! Errors are split along the propagation boundary of §7-style policy:
//! systemic failures (configuration, device, stack) terminate the proxy,
//! while per-flow failures (dial, relay I/O) stay `std::io::Error` inside
//! the flow layer and are counted rather than propagated.

use std::io;

use thiserror::Error;

/// Top-level error type for the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid options at construction
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TUN device read/write failure while running
    #[error("TUN device error: {0}")]
    Device(#[source] io::Error),

    /// Packet injection or emission failure in the user-space stack
    #[error("network stack error: {0}")]
    Stack(String),

    /// Operation invoked on a proxy that is closing or already closed
    #[error("proxy is closed")]
    Closed,

    /// I/O errors not covered by another category
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Whether this error terminates the proxy as a whole.
    ///
    /// Fatal errors are recorded by the lifecycle supervisor and returned
    /// from `serve`. Everything else is contained within a single flow.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Device(_) | Self::Stack(_) => true,
            Self::Closed => false,
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stack error
    pub fn stack(msg: impl Into<String>) -> Self {
        Self::Stack(msg.into())
    }
}

/// Type alias for Result with `ProxyError`
pub type Result<T> = std::result::Result<T, ProxyError>;
