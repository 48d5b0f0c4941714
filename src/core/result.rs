// src/core/result.rs

//! Query result containers.
//!
//! The engine treats results as opaque beyond three observable facts:
//! empty/non-empty, error/success, and affected-row count. Interpreting
//! column contents is delegated to an external [`RowDecoder`].

use crate::core::PoolError;
use bytes::Bytes;

/// One raw result row: column values as delivered by the transport.
/// `None` marks a SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<Option<Bytes>>,
}

impl Row {
    pub fn new(columns: Vec<Option<Bytes>>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Raw bytes of one column, or `None` for SQL NULL or out-of-range index.
    pub fn raw(&self, index: usize) -> Option<&Bytes> {
        self.columns.get(index).and_then(|c| c.as_ref())
    }

    /// Hands the raw columns to an external decoder. The engine itself never
    /// interprets column contents.
    pub fn decode_with<D: RowDecoder>(&self, decoder: &D) -> Result<D::Output, PoolError> {
        decoder.decode(&self.columns)
    }
}

/// External row-decoding interface. Pure, synchronous, side-effect free.
pub trait RowDecoder {
    type Output;

    fn decode(&self, columns: &[Option<Bytes>]) -> Result<Self::Output, PoolError>;
}

/// The result of one statement within a query: its rows plus the
/// server-reported affected-row count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<Row>,
    pub affected: u64,
}

/// An ordered sequence of per-statement result batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub batches: Vec<Batch>,
}

impl QueryResult {
    /// True when no statement produced any rows.
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.rows.is_empty())
    }

    /// Total affected-row count across all statements.
    pub fn affected_rows(&self) -> u64 {
        self.batches.iter().map(|b| b.affected).sum()
    }

    /// Iterates rows across all batches, in server delivery order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.batches.iter().flat_map(|b| b.rows.iter())
    }
}
