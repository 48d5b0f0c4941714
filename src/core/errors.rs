// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the pool.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a statement. Carries the server-provided error
    /// code/category where the transport makes one available.
    #[error("Query failed ({code}): {message}")]
    Query { code: String, message: String },

    #[error("Pool disconnected, request cancelled")]
    Cancelled,

    /// A transaction token referenced a session that no longer exists.
    /// This is a programmer error and is reported, never silently ignored.
    #[error("No such session: {0}")]
    SessionGone(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal pool error: {0}")]
    Internal(String),
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PoolError::Io(e1), PoolError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PoolError::ConnectFailed(s1), PoolError::ConnectFailed(s2)) => s1 == s2,
            (PoolError::Protocol(s1), PoolError::Protocol(s2)) => s1 == s2,
            (
                PoolError::Query {
                    code: c1,
                    message: m1,
                },
                PoolError::Query {
                    code: c2,
                    message: m2,
                },
            ) => c1 == c2 && m1 == m2,
            (PoolError::SessionGone(s1), PoolError::SessionGone(s2)) => s1 == s2,
            (PoolError::InvalidRequest(s1), PoolError::InvalidRequest(s2)) => s1 == s2,
            (PoolError::Internal(s1), PoolError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for PoolError {
    fn from(e: std::str::Utf8Error) -> Self {
        PoolError::Protocol(format!("invalid UTF-8 in server message: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for PoolError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PoolError::Protocol(format!("invalid UTF-8 in server message: {e}"))
    }
}
