//! The source-provider contract.
//!
//! A provider owns one connection to a network-state origin (a local
//! kernel socket, a remote agent, a replayed capture) and exposes the
//! snapshot-plus-stream interface the source pump consumes. Wire
//! decoding is entirely the provider's concern; it hands the engine
//! fully decoded [`Record`]s.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::event::Record;

/// One streamed item from a provider.
#[derive(Debug)]
pub enum ProviderEvent {
    /// A batch of decoded state-change records.
    Records(Vec<Record>),
    /// The provider requests a graceful reconnect: the pump drains its
    /// queue behind a barrier and connects again.
    Restart,
}

/// Connection to one network-state origin.
///
/// `bind` switches the connection into event-streaming mode; the four
/// snapshot calls dump current state; `next_event` blocks for the next
/// streamed batch. `close` must release the connection and unblock any
/// concurrent `next_event`.
#[async_trait]
pub trait Provider: Send {
    /// Binds the connection in event-streaming mode.
    async fn bind(&mut self) -> Result<()>;

    /// Dumps the current interface table.
    async fn links(&mut self) -> Result<Vec<Record>>;

    /// Dumps the current address table.
    async fn addresses(&mut self) -> Result<Vec<Record>>;

    /// Dumps the current neighbour table.
    async fn neighbours(&mut self) -> Result<Vec<Record>>;

    /// Dumps the current routing table.
    async fn routes(&mut self) -> Result<Vec<Record>>;

    /// Waits for the next streamed event batch.
    async fn next_event(&mut self) -> Result<ProviderEvent>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Constructor for restartable providers.
pub type ProviderFactory = Box<dyn Fn() -> Result<Box<dyn Provider>> + Send + Sync>;

/// How a source obtains its provider handle.
pub enum ProviderSpec {
    /// A single, already-constructed handle. Reused across reconnects;
    /// the source can rebind it but never construct a replacement.
    Handle(Option<Box<dyn Provider>>),
    /// A constructor invoked for a fresh handle on every (re)connect.
    Factory(ProviderFactory),
}

impl ProviderSpec {
    /// Wraps an already-constructed provider handle.
    pub fn handle(provider: Box<dyn Provider>) -> Self {
        ProviderSpec::Handle(Some(provider))
    }

    /// Wraps a provider constructor.
    pub fn factory<F>(make: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Provider>> + Send + Sync + 'static,
    {
        ProviderSpec::Factory(Box::new(make))
    }
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSpec::Handle(Some(_)) => f.write_str("ProviderSpec::Handle"),
            ProviderSpec::Handle(None) => f.write_str("ProviderSpec::Handle(consumed)"),
            ProviderSpec::Factory(_) => f.write_str("ProviderSpec::Factory"),
        }
    }
}
