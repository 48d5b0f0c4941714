// src/core/request.rs

//! Defines `Request`, one queued operation awaiting dispatch to a connection.

use crate::core::errors::PoolError;
use crate::core::result::{Batch, QueryResult};
use std::fmt;
use std::time::Instant;
use tokio::sync::oneshot;

/// Identity of one physical connection. A reconnected link receives a fresh
/// session id, so tokens referring to a dead session fail loudly instead of
/// landing on the wrong connection.
pub type SessionId = u64;

/// Caching classification of a query. Selects how long a cached result
/// remains valid; `None` bypasses the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlClass {
    #[default]
    None,
    Short,
    Mid,
    Long,
}

impl TtlClass {
    /// One-letter cache-key suffix, so identical text under different TTL
    /// classes is cached independently.
    pub fn suffix(&self) -> Option<char> {
        match self {
            TtlClass::None => None,
            TtlClass::Short => Some('s'),
            TtlClass::Mid => Some('m'),
            TtlClass::Long => Some('l'),
        }
    }
}

/// What the statement does to the executing connection's bookkeeping once it
/// completes successfully.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Query,
    /// Pins `in_transaction` on the executing connection.
    Begin,
    /// Clears `in_transaction` on the executing connection.
    Commit,
    /// Clears `in_transaction` on the executing connection.
    Rollback,
    /// Records the named channels on the executing connection.
    Listen(Vec<String>),
    /// Removes the named channels from the executing connection.
    Unlisten(Vec<String>),
}

/// Payload delivered through a request's completion channel: the session that
/// executed the statement (used as the transaction affinity token) plus the
/// accumulated result.
pub type Reply = Result<(SessionId, QueryResult), PoolError>;

/// Streaming callback, invoked once per result chunk instead of accumulating
/// batches into a `QueryResult`.
pub type ChunkCallback = Box<dyn FnMut(Batch) + Send>;

/// One queued operation. Created on submission, moved into a connection on
/// assignment, destroyed after its future is resolved.
pub struct Request {
    /// Final query text. Immutable once created.
    pub text: String,
    /// Binds this request to one connection's session for transaction
    /// continuation. `None` means any connection may take it.
    pub affinity: Option<SessionId>,
    pub ttl: TtlClass,
    pub kind: RequestKind,
    /// Exactly one writer (the dispatch loop) and one reader (the caller).
    pub reply: oneshot::Sender<Reply>,
    pub chunk: Option<ChunkCallback>,
    /// Submission timestamp, for timing telemetry.
    pub created: Instant,
}

impl Request {
    pub fn new(text: String, ttl: TtlClass, affinity: Option<SessionId>) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                text,
                affinity,
                ttl,
                kind: RequestKind::Query,
                reply: tx,
                chunk: None,
                created: Instant::now(),
            },
            rx,
        )
    }

    /// Resolves the completion future. A dropped receiver is not an error;
    /// the caller simply stopped waiting.
    pub fn resolve(self, reply: Reply) {
        let _ = self.reply.send(reply);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("text", &self.text)
            .field("affinity", &self.affinity)
            .field("ttl", &self.ttl)
            .field("kind", &self.kind)
            .field("streaming", &self.chunk.is_some())
            .finish()
    }
}
