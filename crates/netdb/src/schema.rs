//! The relational-store contract.
//!
//! The schema owns table layout, SQL dialect, row storage and the write
//! path; the engine only issues `apply`/`flush`/`mark`/`fetch`/`execute`
//! calls against it. The store is the single source of truth: proxy
//! objects re-query it on every read.

use anyhow::Result;
use serde_json::Value;

use crate::event::{Record, Target};
use crate::objects::ObjectKind;

/// One fetched row, column values in projection order.
pub type Row = Vec<Value>;

/// Relational store backing the mirror.
///
/// Implementations guard their connection internally; the engine may
/// call from the dispatcher task and from API threads concurrently.
pub trait Schema: Send + Sync {
    /// Applies one state-change record for `target` to the store.
    ///
    /// This is the permanent per-kind handler body merged into the
    /// dispatcher's registry at startup, ahead of any object-level
    /// subscription.
    fn apply(&self, target: &Target, record: &Record) -> Result<()>;

    /// Discards all rows belonging to `target`.
    fn flush(&self, target: &Target) -> Result<()>;

    /// Flags all rows belonging to `target` with `flag`.
    ///
    /// Non-destructive: rows stay queryable, marked stale.
    fn mark(&self, target: &Target, flag: i64) -> Result<()>;

    /// Runs a query and returns its rows.
    fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Runs a statement without results.
    fn execute(&self, query: &str, params: &[Value]) -> Result<()>;

    /// Column names of the projection for `kind`, in table order.
    fn columns(&self, kind: ObjectKind) -> &[&str];

    /// Natural-key column names for `kind` (excluding `target`).
    fn key_fields(&self, kind: ObjectKind) -> &[&str];

    /// The dialect's parameter placeholder token.
    fn placeholder(&self) -> &str;

    /// Commits pending writes.
    fn commit(&self) -> Result<()>;

    /// Commits and releases the store.
    fn close(&self) -> Result<()>;
}
