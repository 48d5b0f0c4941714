// src/core/mod.rs

//! The central module containing the leaf data structures of the pool engine:
//! errors, requests, results, the TTL result cache, and the external
//! template-store interface.

pub mod cache;
pub mod errors;
pub mod request;
pub mod result;
pub mod templates;

pub use errors::PoolError;
pub use request::{Request, RequestKind, SessionId, TtlClass};
pub use result::{Batch, QueryResult, Row, RowDecoder};
