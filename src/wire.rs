// src/wire.rs

//! The opaque transport boundary.
//!
//! Byte-level framing of the wire protocol is out of scope for the engine;
//! a connection-establishment helper supplies a fully handshaken
//! [`WireStream`] and the engine only ever exchanges whole statements and
//! whole protocol messages with it.

use crate::config::ConnectOptions;
use crate::core::result::Batch;
use crate::core::PoolError;
use async_trait::async_trait;
use bytes::Bytes;

/// One complete inbound protocol message, as decoded by the transport.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// One statement's worth of rows and its affected-row count.
    Batch(Batch),
    /// No more results for the current query; the stream is ready for the
    /// next statement.
    Ready,
    /// The server rejected the current statement. Terminal for the query:
    /// the stream is ready for the next statement afterwards.
    ServerError { code: String, message: String },
    /// Asynchronous server push on a subscribed channel.
    Notification {
        channel: String,
        payload: Bytes,
        pid: u64,
    },
}

/// A fully handshaken wire connection.
///
/// `recv` must be cancel-safe: the engine polls it inside `select!` and may
/// drop the future between complete messages.
#[async_trait]
pub trait WireStream: Send {
    /// Queues one statement's text for transmission.
    async fn send(&mut self, text: &str) -> Result<(), PoolError>;

    /// Next inbound message. Returns `PoolError::ConnectionLost` on EOF or a
    /// mid-stream socket error.
    async fn recv(&mut self) -> Result<WireMessage, PoolError>;

    /// Graceful close. Errors are ignorable; the link is going away.
    async fn shutdown(&mut self) -> Result<(), PoolError>;
}

/// The connection-establishment helper: performs the full multi-phase
/// handshake (transport connect, protocol negotiation, optional TLS upgrade,
/// authentication) and returns a ready stream.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn WireStream>, PoolError>;
}
