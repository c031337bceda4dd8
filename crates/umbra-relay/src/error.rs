//! Error types for the relay layer
//!
//! Errors follow the failure taxonomy of the relay protocol so callers can
//! decide between retrying, reselecting and giving up.
//!
//! # Error Categories
//!
//! - **Transient**: link failures, timeouts and an unready overlay. A new relay
//!   or a later attempt may succeed.
//! - **Protocol violations**: malformed or unexpected messages, bad signatures,
//!   duplicate sources. The connection is closed abnormally.
//! - **Denial**: a relay refused admission. Not an error for the denied party,
//!   whose alternative contacts are folded into the backup pool.
//!
//! # Example
//!
//! ```
//! use umbra_relay::ProxyError;
//!
//! let err = ProxyError::transport("link closed");
//! assert!(err.is_transient());
//! assert!(!err.is_protocol_violation());
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in relay operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    // ============ Transport Errors ============
    /// Link establishment or I/O failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Protocol Errors ============
    /// Peer violated the relay protocol
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Relay refused admission
    #[error("Relay denied admission")]
    Denied,

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(Cow<'static, str>),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Request Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Caller supplied a value the protocol cannot carry
    #[error("Invalid value: {0}")]
    InvalidValue(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Overlay identity or DHT not ready
    #[error("Not ready: {0}")]
    NotReady(Cow<'static, str>),

    /// Manager is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

impl ProxyError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport(_) | ProxyError::Timeout(_) | ProxyError::NotReady(_)
        )
    }

    /// Returns true if the peer broke the protocol
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProxyError::Protocol(_) | ProxyError::Codec(_) | ProxyError::Crypto(_)
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        ProxyError::Transport(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        ProxyError::Protocol(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        ProxyError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid value error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_value(context: &'static str) -> Self {
        ProxyError::InvalidValue(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        ProxyError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a not-ready error with static context (zero allocation)
    #[must_use]
    pub const fn not_ready(context: &'static str) -> Self {
        ProxyError::NotReady(Cow::Borrowed(context))
    }
}

impl From<umbra_crypto::CryptoError> for ProxyError {
    fn from(err: umbra_crypto::CryptoError) -> Self {
        ProxyError::Crypto(err.to_string())
    }
}

impl From<bincode::Error> for ProxyError {
    fn from(err: bincode::Error) -> Self {
        ProxyError::Codec(Cow::Owned(err.to_string()))
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, ProxyError>;
