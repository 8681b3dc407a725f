//! Continuous mirror of kernel network state.
//!
//! `netdb` keeps a relational store synchronized with one or more
//! network-state sources. Each source pumps an initial snapshot plus an
//! incremental event stream into a bounded queue; a single dispatcher
//! task applies everything, in order, through per-kind handler chains.
//! Callers never read engine-held state: they query the store through
//! ephemeral [`Proxy`] objects produced by [`View`]s, or block on
//! convergence with [`NetDb::wait`].
//!
//! ```no_run
//! # async fn demo(provider: Box<dyn netdb::Provider>, schema: std::sync::Arc<dyn netdb::Schema>) -> netdb::Result<()> {
//! use netdb::{Config, NetDb, SourceSpec, Target, WaitSpec};
//!
//! let db = NetDb::new(
//!     schema,
//!     vec![(Target::localhost(), SourceSpec::handle(provider))],
//!     Config::default(),
//! )
//! .await?;
//!
//! db.wait(WaitSpec::new().interface("eth0")).await?;
//! let mtu = db.interfaces().get("eth0")?.field("mtu")?;
//! println!("eth0 mtu: {mtu:?}");
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
pub mod error;
pub mod event;
pub mod handlers;
pub mod objects;
pub mod provider;
pub mod report;
pub mod schema;
pub mod source;
mod wait;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use crate::error::{Error, Result};
pub use crate::event::{
    ControlSignal, Envelope, EventKind, Payload, Record, RecordOp, Target,
};
pub use crate::handlers::{Handler, HandlerError, HandlerId, HandlerRegistry};
pub use crate::objects::{Key, ObjectKind, ObjectRegistry, Proxy, View};
pub use crate::provider::{Provider, ProviderEvent, ProviderFactory, ProviderSpec};
pub use crate::report::Report;
pub use crate::schema::{Row, Schema};
pub use crate::source::{Source, SourceSpec, SourceState, SOURCE_FAIL_PAUSE};
pub use crate::wait::WaitSpec;

use crate::dispatch::Dispatcher;
use crate::source::SourceMap;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the bounded event queue; full means backpressure on
    /// the pumps, never loss.
    pub queue_depth: usize,
    /// How often the dispatcher sweeps dead object references.
    pub gc_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_depth: 100,
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// The mirror engine.
///
/// Owns the store, the event queue, the dispatcher task and the source
/// set. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct NetDb {
    schema: Arc<dyn Schema>,
    registry: Arc<HandlerRegistry>,
    objects: Arc<ObjectRegistry>,
    sources: Arc<SourceMap>,
    evq: mpsc::Sender<Envelope>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NetDb {
    /// Starts the engine: registers the per-kind schema handlers, spawns
    /// the dispatcher and the initial sources, then blocks until every
    /// initial source has finished (or failed) its first load.
    pub async fn new(
        schema: Arc<dyn Schema>,
        initial: Vec<(Target, SourceSpec)>,
        config: Config,
    ) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::new());

        // Schema handlers go in before any source can enqueue, so rows
        // are always materialized ahead of object-level subscribers.
        for kind in EventKind::ALL {
            let schema = schema.clone();
            registry.register(
                kind,
                Box::new(move |target, record| {
                    schema.apply(target, record).map_err(HandlerError::Failed)
                }),
            );
        }

        let (evq, queue) = mpsc::channel(config.queue_depth);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let sources = Arc::new(SourceMap::new());
        let objects = Arc::new(ObjectRegistry::new());

        let dispatcher = Dispatcher {
            evq: queue,
            registry: registry.clone(),
            schema: schema.clone(),
            sources: sources.clone(),
            objects: objects.clone(),
            ready: ready_tx,
            countdown: initial.len(),
            gc_interval: config.gc_interval,
        };
        let handle = tokio::spawn(dispatcher.run());

        let db = Self {
            schema,
            registry,
            objects,
            sources,
            evq,
            dispatcher: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        };

        for (target, spec) in initial {
            let source = Arc::new(Source::new(
                db.evq.clone(),
                target.clone(),
                spec,
                Some(ControlSignal::SyncStarted),
            ));
            source.start()?;
            db.sources.insert(target, source);
        }

        // The dispatcher flips this once it has counted one SyncStarted
        // per initial source, successful or not.
        let _ = ready_rx.wait_for(|ready| *ready).await;
        info!(sources = db.sources.all().len(), "engine ready");
        Ok(db)
    }

    /// Connects a new source under `target` and blocks until its first
    /// snapshot has been applied to the store (or its first load failed;
    /// check [`NetDb::source_state`]).
    ///
    /// An existing source under the same target is disconnected first
    /// and its rows flushed.
    pub async fn connect_source(&self, target: Target, spec: SourceSpec) -> Result<()> {
        self.ensure_open()?;
        if self.sources.contains(&target) {
            debug!(target = %target, "replacing existing source");
            self.disconnect_source(&target, true).await?;
        }

        let gate = Arc::new(Notify::new());
        let source = Arc::new(Source::new(
            self.evq.clone(),
            target.clone(),
            spec,
            Some(ControlSignal::Ready(gate.clone())),
        ));
        source.start()?;
        self.sources.insert(target, source);
        gate.notified().await;
        Ok(())
    }

    /// Disconnects and removes the source under `target`, waiting for
    /// its pump to drain. With `flush`, the target's rows are discarded;
    /// without, they stay queryable as a last-known snapshot.
    pub async fn disconnect_source(&self, target: &Target, flush: bool) -> Result<()> {
        self.ensure_open()?;
        let source = self
            .sources
            .remove(target)
            .ok_or_else(|| Error::UnknownSource(target.clone()))?;
        source.close().await;
        if flush {
            self.schema.flush(target).map_err(Error::schema)?;
        }
        Ok(())
    }

    /// Current lifecycle state of the source under `target`.
    pub fn source_state(&self, target: &Target) -> Option<SourceState> {
        self.sources.get(target).map(|source| source.state())
    }

    /// Appends a caller-supplied handler to the chain for `kind`.
    ///
    /// Handlers run on the dispatcher task, after the schema handler for
    /// the same kind; a slow handler stalls ingestion.
    pub fn register_handler(&self, kind: EventKind, handler: Handler) -> Result<HandlerId> {
        self.ensure_open()?;
        Ok(self.registry.register(kind, handler))
    }

    /// Removes a previously registered handler.
    pub fn unregister_handler(&self, kind: EventKind, id: HandlerId) -> Result<()> {
        self.registry.unregister(kind, id)
    }

    /// Number of handlers currently chained for `kind`, the permanent
    /// schema handler included.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.len(kind)
    }

    /// Blocks until every condition in `spec` holds in the store.
    ///
    /// Errors immediately if a condition names a target whose source is
    /// missing or not running.
    pub async fn wait(&self, spec: WaitSpec) -> Result<()> {
        self.ensure_open()?;
        wait::wait(&self.registry, &self.sources, &self.schema, spec).await
    }

    /// A view over one object kind.
    pub fn view(&self, kind: ObjectKind) -> View {
        View::new(
            kind,
            self.schema.clone(),
            self.registry.clone(),
            self.objects.clone(),
        )
    }

    /// The interfaces view.
    pub fn interfaces(&self) -> View {
        self.view(ObjectKind::Interfaces)
    }

    /// The VLAN-interfaces view.
    pub fn vlans(&self) -> View {
        self.view(ObjectKind::Vlan)
    }

    /// The bridge-interfaces view.
    pub fn bridges(&self) -> View {
        self.view(ObjectKind::Bridge)
    }

    /// The addresses view.
    pub fn addresses(&self) -> View {
        self.view(ObjectKind::Addresses)
    }

    /// The routes view.
    pub fn routes(&self) -> View {
        self.view(ObjectKind::Routes)
    }

    /// The neighbours view.
    pub fn neighbours(&self) -> View {
        self.view(ObjectKind::Neighbours)
    }

    /// Runs a raw query against the store.
    pub fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.schema.fetch(query, params).map_err(Error::schema)
    }

    /// Runs a raw statement against the store.
    pub fn execute(&self, query: &str, params: &[Value]) -> Result<()> {
        self.schema.execute(query, params).map_err(Error::schema)
    }

    /// The live-object registry, for introspection.
    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// Shuts the engine down: stops every source, drains the queue,
    /// terminates the dispatcher and releases the store. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Queue the shutdown behind whatever is already in flight, so
        // every pending event still lands in the store.
        let shutdown = Envelope::signal(Target::localhost(), ControlSignal::ShutdownAll);
        let _ = self.evq.send(shutdown).await;

        for source in self.sources.drain() {
            source.close().await;
        }

        let exit = Envelope::signal(Target::localhost(), ControlSignal::ExitDispatcher);
        let _ = self.evq.send(exit).await;

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!(error = %err, "dispatcher task panicked");
                }
            }
        }

        self.schema.close().map_err(Error::schema)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for NetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDb")
            .field("sources", &self.sources.all().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
