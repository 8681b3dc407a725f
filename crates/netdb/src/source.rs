//! Per-target event sources.
//!
//! A [`Source`] owns one provider connection and pumps its initial
//! snapshot plus the subsequent incremental stream into the shared
//! event queue. The pump runs a connection state machine
//! (`Init -> Connecting -> Loading -> Running -> {Stopped, Failed}`)
//! with persistent-reconnect backoff, and drains the queue behind a
//! barrier on every disconnect so messages for one target never
//! reorder across a reconnect boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{ControlSignal, Envelope, Target};
use crate::provider::{Provider, ProviderEvent, ProviderSpec};

/// Default pause before a persistent source retries a failed connect.
pub const SOURCE_FAIL_PAUSE: Duration = Duration::from_secs(5);

/// Connection lifecycle states of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Constructed, pump not yet started.
    Init,
    /// Obtaining a provider handle.
    Connecting,
    /// Binding and enqueueing the initial snapshot.
    Loading,
    /// Streaming incremental events.
    Running,
    /// Disconnected; the pump is draining or has exited cleanly.
    Stopped,
    /// Connect or load failed; rows are flagged stale.
    Failed,
}

impl SourceState {
    /// Returns the state name.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Init => "init",
            SourceState::Connecting => "connecting",
            SourceState::Loading => "loading",
            SourceState::Running => "running",
            SourceState::Stopped => "stopped",
            SourceState::Failed => "failed",
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source construction options.
#[derive(Debug)]
pub struct SourceSpec {
    /// How the pump obtains its provider handle.
    pub provider: ProviderSpec,
    /// Retry failed connects indefinitely with a fixed pause.
    pub persistent: bool,
    /// Pause between failed connect attempts.
    pub fail_pause: Duration,
    /// Debug-log every envelope this source enqueues.
    pub event_log: bool,
}

impl SourceSpec {
    /// A non-persistent source over an already-constructed handle.
    pub fn handle(provider: Box<dyn Provider>) -> Self {
        Self {
            provider: ProviderSpec::handle(provider),
            persistent: false,
            fail_pause: SOURCE_FAIL_PAUSE,
            event_log: false,
        }
    }

    /// A persistent source over a provider constructor.
    pub fn factory<F>(make: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Provider>> + Send + Sync + 'static,
    {
        Self {
            provider: ProviderSpec::factory(make),
            persistent: true,
            fail_pause: SOURCE_FAIL_PAUSE,
            event_log: false,
        }
    }

    /// Overrides the persistence flag.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Overrides the failure backoff pause.
    pub fn fail_pause(mut self, pause: Duration) -> Self {
        self.fail_pause = pause;
        self
    }

    /// Enables per-envelope debug logging.
    pub fn event_log(mut self, enabled: bool) -> Self {
        self.event_log = enabled;
        self
    }
}

/// One connected event source.
pub struct Source {
    target: Target,
    state_rx: watch::Receiver<SourceState>,
    shutdown: CancellationToken,
    persistent: bool,
    seed: Mutex<Option<Pump>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Source {
    /// Builds a source; the pump starts on [`Source::start`].
    pub fn new(
        evq: mpsc::Sender<Envelope>,
        target: Target,
        spec: SourceSpec,
        event: Option<ControlSignal>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SourceState::Init);
        let shutdown = CancellationToken::new();
        let pump = Pump {
            target: target.clone(),
            evq,
            state: state_tx,
            shutdown: shutdown.clone(),
            persistent: spec.persistent,
            fail_pause: spec.fail_pause,
            event_log: spec.event_log,
            event,
            spec: spec.provider,
            nl: None,
        };
        Self {
            target,
            state_rx,
            shutdown,
            persistent: spec.persistent,
            seed: Mutex::new(Some(pump)),
            task: Mutex::new(None),
        }
    }

    /// The source's target identifier.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        *self.state_rx.borrow()
    }

    /// Whether failed connects are retried.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Spawns the pump task.
    ///
    /// Errors with [`Error::SourceRunning`] if the pump is already live.
    pub fn start(&self) -> Result<()> {
        let pump = self
            .seed
            .lock()
            .take()
            .ok_or_else(|| Error::SourceRunning(self.target.clone()))?;
        let handle = tokio::spawn(pump.run());
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Requests cooperative shutdown without waiting.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Signals shutdown, unblocks the provider read and waits for the
    /// pump task to exit. Safe to call more than once and concurrently
    /// with a failing pump.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!(target = %self.target, error = %err, "source close: pump task panicked");
                }
            }
        }
    }

    /// Waits until the source reported its first load attempt, for
    /// better or worse (`Running`, `Stopped` or `Failed`).
    pub async fn wait_started(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|state| {
                matches!(
                    state,
                    SourceState::Running | SourceState::Stopped | SourceState::Failed
                )
            })
            .await;
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] <source {}>", self.state(), self.target)
    }
}

/// How one connect-stream cycle ended.
enum CycleEnd {
    /// Graceful disconnect; the barrier has been drained.
    Disconnected,
    /// Shutdown was requested while streaming.
    Shutdown,
    /// The event queue is gone; the dispatcher has exited.
    QueueClosed,
}

/// The pump: owns the provider handle and runs the connect loop.
struct Pump {
    target: Target,
    evq: mpsc::Sender<Envelope>,
    state: watch::Sender<SourceState>,
    shutdown: CancellationToken,
    persistent: bool,
    fail_pause: Duration,
    event_log: bool,
    event: Option<ControlSignal>,
    spec: ProviderSpec,
    nl: Option<Box<dyn Provider>>,
}

impl Pump {
    async fn run(mut self) {
        loop {
            // A previous handle is closed before a new one is opened.
            if let Some(nl) = self.nl.as_mut() {
                if let Err(err) = nl.close().await {
                    warn!(target = %self.target, error = %err, "source restart: provider close failed");
                }
            }

            match self.cycle().await {
                Ok(CycleEnd::Disconnected) => {
                    if self.persistent && !self.shutdown.is_cancelled() {
                        debug!(target = %self.target, "source reconnecting");
                        continue;
                    }
                    break;
                }
                Ok(CycleEnd::Shutdown) | Ok(CycleEnd::QueueClosed) => break,
                Err(err) => {
                    self.state.send_replace(SourceState::Failed);
                    error!(target = %self.target, error = %err, "source error");
                    let mark = Envelope::signal(self.target.clone(), ControlSignal::MarkFailed);
                    if self.evq.send(mark).await.is_err() {
                        break;
                    }
                    // A failed first load still releases anyone gated on
                    // the startup signal; they observe the Failed state.
                    if let Some(signal) = self.event.take() {
                        let envelope = Envelope::signal(self.target.clone(), signal);
                        if self.evq.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    if !self.persistent {
                        break;
                    }
                    debug!(target = %self.target, "sleeping before restart");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            debug!(target = %self.target, "source shutdown");
                            break;
                        }
                        _ = tokio::time::sleep(self.fail_pause) => {}
                    }
                }
            }
        }

        if let Some(nl) = self.nl.as_mut() {
            if let Err(err) = nl.close().await {
                debug!(target = %self.target, error = %err, "source close: {err}");
            }
        }
    }

    /// One connect -> load -> stream cycle.
    async fn cycle(&mut self) -> anyhow::Result<CycleEnd> {
        self.state.send_replace(SourceState::Connecting);
        match &mut self.spec {
            // Restartable sources construct a fresh handle every cycle.
            ProviderSpec::Factory(make) => {
                self.nl = Some(make()?);
            }
            // Single-shot sources reuse the one handle they were given.
            ProviderSpec::Handle(prime) => {
                if self.nl.is_none() {
                    self.nl = Some(prime.take().ok_or_else(|| {
                        anyhow::anyhow!("single-shot provider handle already consumed")
                    })?);
                }
            }
        }
        let target = self.target.clone();
        let Some(nl) = self.nl.as_mut() else {
            anyhow::bail!("no provider handle");
        };

        self.state.send_replace(SourceState::Loading);
        nl.bind().await?;

        // Initial load: flush the target's rows, then snapshot every
        // table as its own envelope, in order.
        let flush = Envelope::signal(target.clone(), ControlSignal::SchemaFlush);
        if self.evq.send(flush).await.is_err() {
            return Ok(CycleEnd::QueueClosed);
        }
        for records in [
            nl.links().await?,
            nl.addresses().await?,
            nl.neighbours().await?,
            nl.routes().await?,
        ] {
            if self
                .evq
                .send(Envelope::records(target.clone(), records))
                .await
                .is_err()
            {
                return Ok(CycleEnd::QueueClosed);
            }
        }

        self.state.send_replace(SourceState::Running);
        // One-shot startup signal, fired after the first load only.
        if let Some(signal) = self.event.take() {
            if self
                .evq
                .send(Envelope::signal(target.clone(), signal))
                .await
                .is_err()
            {
                return Ok(CycleEnd::QueueClosed);
            }
        }

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    drain_queue(&self.evq, &self.state, &target).await;
                    return Ok(CycleEnd::Shutdown);
                }
                event = nl.next_event() => event,
            };
            match event {
                Ok(ProviderEvent::Records(records)) => {
                    let envelope = Envelope::records(target.clone(), records);
                    if self.event_log {
                        debug!(target = %target, items = envelope.items.len(), "source event");
                    }
                    if self.evq.send(envelope).await.is_err() {
                        return Ok(CycleEnd::QueueClosed);
                    }
                }
                Ok(ProviderEvent::Restart) => {
                    drain_queue(&self.evq, &self.state, &target).await;
                    return Ok(CycleEnd::Disconnected);
                }
                Err(err) => {
                    error!(target = %target, error = %err, "source error");
                    drain_queue(&self.evq, &self.state, &target).await;
                    return Ok(CycleEnd::Disconnected);
                }
            }
        }
    }
}

/// Enqueues a drain barrier and blocks until the dispatcher has applied
/// every message this source sent before it.
///
/// Without the barrier, a reconnect could enqueue a fresh
/// flush-plus-snapshot while older messages for the same target are
/// still queued, and a disconnect could let `close()` return while
/// stale rows are still being applied.
async fn drain_queue(
    evq: &mpsc::Sender<Envelope>,
    state: &watch::Sender<SourceState>,
    target: &Target,
) {
    state.send_replace(SourceState::Stopped);
    let gate = Arc::new(Notify::new());
    let barrier = Envelope::signal(target.clone(), ControlSignal::Barrier(gate.clone()));
    if evq.send(barrier).await.is_ok() {
        gate.notified().await;
    }
}

/// The live sources, keyed by target.
#[derive(Default)]
pub(crate) struct SourceMap {
    inner: Mutex<HashMap<Target, Arc<Source>>>,
}

impl SourceMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, target: Target, source: Arc<Source>) {
        self.inner.lock().insert(target, source);
    }

    pub(crate) fn remove(&self, target: &Target) -> Option<Arc<Source>> {
        self.inner.lock().remove(target)
    }

    pub(crate) fn get(&self, target: &Target) -> Option<Arc<Source>> {
        self.inner.lock().get(target).cloned()
    }

    pub(crate) fn contains(&self, target: &Target) -> bool {
        self.inner.lock().contains_key(target)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Source>> {
        self.inner.lock().values().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Source>> {
        self.inner.lock().drain().map(|(_, source)| source).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SourceState::Init.as_str(), "init");
        assert_eq!(SourceState::Running.to_string(), "running");
        assert_eq!(SourceState::Failed.to_string(), "failed");
    }

    // Multi-thread runtime: the pump task must be movable across
    // worker threads even when it owns a provider handle.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_fails() {
        struct NullProvider;
        #[async_trait::async_trait]
        impl Provider for NullProvider {
            async fn bind(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn links(&mut self) -> anyhow::Result<Vec<crate::event::Record>> {
                Ok(vec![])
            }
            async fn addresses(&mut self) -> anyhow::Result<Vec<crate::event::Record>> {
                Ok(vec![])
            }
            async fn neighbours(&mut self) -> anyhow::Result<Vec<crate::event::Record>> {
                Ok(vec![])
            }
            async fn routes(&mut self) -> anyhow::Result<Vec<crate::event::Record>> {
                Ok(vec![])
            }
            async fn next_event(&mut self) -> anyhow::Result<ProviderEvent> {
                std::future::pending().await
            }
            async fn close(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (tx, mut rx) = mpsc::channel(16);
        let source = Source::new(
            tx,
            Target::localhost(),
            SourceSpec::handle(Box::new(NullProvider)),
            None,
        );
        source.start().expect("first start");
        assert!(matches!(source.start(), Err(Error::SourceRunning(_))));

        source.wait_started().await;
        assert_eq!(source.state(), SourceState::Running);

        // Drop the queue so the drain barrier cannot block, then shut
        // down; the pump is parked in next_event and close() must
        // unblock it.
        while rx.try_recv().is_ok() {}
        drop(rx);
        source.close().await;
    }
}
