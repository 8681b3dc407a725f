//! Error types for the netdb engine.

use thiserror::Error;

use crate::event::{EventKind, Target};
use crate::objects::ObjectKind;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum Error {
    /// `start()` was called on a source whose pump is already live.
    #[error("source [{0}] is already running")]
    SourceRunning(Target),

    /// The operation needs a source in the `Running` state.
    #[error("source [{0}] is not running")]
    SourceNotRunning(Target),

    /// No source is registered under this target.
    #[error("no such source: {0}")]
    UnknownSource(Target),

    /// The configured provider kind is not recognized; fatal, never retried.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// No row matches the requested key.
    #[error("no {kind} row matches {key}")]
    NotFound {
        /// Object kind queried.
        kind: ObjectKind,
        /// Rendered key specification.
        key: String,
    },

    /// A match specification referenced a field the store does not have.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// `unregister_handler` for a handler that is not registered.
    #[error("no such handler registered for {0} events")]
    NoSuchHandler(EventKind),

    /// A report format name that is not supported.
    #[error("format not supported: {0}")]
    UnsupportedFormat(String),

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// The event queue was dropped before the operation completed.
    #[error("event queue closed")]
    QueueClosed,

    /// An error from the schema backend.
    #[error("schema error: {0}")]
    Schema(#[source] anyhow::Error),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn schema(err: anyhow::Error) -> Self {
        Error::Schema(err)
    }
}
