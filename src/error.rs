//! Error types for the Squall runtime.
//!
//! One structured error enum covers every layer, with constructor helpers
//! per kind so call sites read `Error::network(...)` rather than building
//! variants by hand.

use std::fmt;

/// Result type alias for Squall operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller misuse: bad argument, handle used in the wrong state. Always
    /// synchronous — never delivered through a callback.
    #[error("argument error: {message}")]
    Argument {
        /// Description of what was wrong with the argument.
        message: String,
    },

    /// Underlying OS I/O failure.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Timer-related errors.
    #[error("timer error: {message}")]
    Timer {
        /// Descriptive error message.
        message: String,
    },

    /// Reactor state errors.
    #[error("reactor error: {message}")]
    Reactor {
        /// Descriptive error message.
        message: String,
    },

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Descriptive error message.
        message: String,
    },

    /// Connect/read/write/DNS failures, surfaced asynchronously through
    /// callbacks.
    #[error("network error: {message}")]
    Network {
        /// Descriptive error message.
        message: String,
    },

    /// Wire-format violation. The parser enters its ERROR state; the owning
    /// client should close the connection.
    #[error("protocol error: {message}")]
    Protocol {
        /// Descriptive error message.
        message: String,
    },

    /// Keepalive miss, QoS retry exhaustion, DNS resolution deadline.
    #[error("timeout: {message}")]
    Timeout {
        /// Descriptive error message.
        message: String,
    },

    /// Resource exhaustion errors (pool out of memory, fd limit, queue full).
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// The exhausted resource type.
        resource: String,
    },

    /// Concurrency-related errors (queue full, stale token, double-close).
    #[error("concurrency error: {message}")]
    Concurrency {
        /// Descriptive error message.
        message: String,
    },

    /// TLS/encryption errors.
    #[error("TLS error: {source}")]
    Tls {
        /// The underlying TLS error.
        #[from]
        source: rustls::Error,
    },

    /// Generic errors with context.
    #[error("squall error: {message}")]
    Other {
        /// Descriptive error message.
        message: String,
    },
}

impl Error {
    /// Create an argument error.
    pub fn argument<S: Into<String>>(message: S) -> Self {
        Self::Argument { message: message.into() }
    }

    /// Create a timer-related error.
    pub fn timer<S: Into<String>>(message: S) -> Self {
        Self::Timer { message: message.into() }
    }

    /// Create a reactor-related error.
    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor { message: message.into() }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a network error.
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network { message: message.into() }
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout { message: message.into() }
    }

    /// Create a resource exhaustion error.
    pub fn resource_exhausted<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExhausted { resource: resource.into() }
    }

    /// Create a concurrency error.
    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::Concurrency { message: message.into() }
    }

    /// Create a generic error.
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other { message: message.into() }
    }

    /// Check if this is a recoverable error — one a caller could plausibly
    /// retry after.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Timeout { .. } => true,
            Self::ResourceExhausted { .. } => true,
            Self::Concurrency { .. } => true,
            Self::Timer { .. } => true,
            Self::Io { .. }
            | Self::Argument { .. }
            | Self::Reactor { .. }
            | Self::Config { .. }
            | Self::Protocol { .. }
            | Self::Tls { .. }
            | Self::Other { .. } => false,
        }
    }

    /// Get the error category, for metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Argument { .. } => "argument",
            Self::Io { .. } => "io",
            Self::Timer { .. } => "timer",
            Self::Reactor { .. } => "reactor",
            Self::Config { .. } => "config",
            Self::Network { .. } => "network",
            Self::Protocol { .. } => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::ResourceExhausted { .. } => "resource",
            Self::Concurrency { .. } => "concurrency",
            Self::Tls { .. } => "tls",
            Self::Other { .. } => "other",
        }
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::argument(format!("invalid address: {e}"))
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::other(format!("tls error: {e}"))
    }
}

/// Wrap a foreign error's `Display` output behind a prefix, as `Error::Other`.
pub(crate) fn wrap<E: fmt::Display>(prefix: &str, e: E) -> Error {
    Error::other(format!("{prefix}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::network("connection reset").is_recoverable());
        assert!(Error::timeout("keepalive missed").is_recoverable());
        assert!(!Error::protocol("bad remaining length").is_recoverable());
        assert!(!Error::argument("negative capacity").is_recoverable());
    }

    #[test]
    fn category_labels() {
        assert_eq!(Error::config("bad field").category(), "config");
        assert_eq!(Error::protocol("oversized packet").category(), "protocol");
    }
}
