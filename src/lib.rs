// src/lib.rs

pub mod cluster;
pub mod config;
pub mod core;
pub mod wire;

// Re-export
pub use crate::cluster::{Cluster, ClusterHooks, QueryHandle, ReconnectReport};
pub use crate::core::{PoolError, QueryResult, TtlClass};
