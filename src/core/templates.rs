// src/core/templates.rs

//! External query-template interface.
//!
//! Placeholder substitution, caching of parsed SQL text, and value escaping
//! live outside the engine. The pool consumes this trait opaquely: it hands
//! over a template plus arguments and forwards the constructed text to
//! `Cluster::query`. Implementations must be pure and synchronous.

use crate::core::PoolError;

/// A query-template store with placeholder substitution.
///
/// The store is created once at startup and shared read-only thereafter;
/// the engine never mutates it.
pub trait TemplateStore: Send + Sync {
    /// Substitutes positional placeholders into `template`. Argument values
    /// must be escaped by the implementation before interpolation.
    fn render_positional(&self, template: &str, args: &[String]) -> Result<String, PoolError>;

    /// Looks up a named, pre-registered template and substitutes named
    /// arguments.
    fn render_named(&self, name: &str, args: &[(String, String)]) -> Result<String, PoolError>;
}
