//! The dispatcher: single consumer of the event queue.
//!
//! Exactly one dispatcher task per engine. It is the only writer of the
//! mirror's synchronization state and the only invoker of handler
//! chains; every state transition flows through it in queue order.
//! Control signals are matched by discriminant; data records fan out to
//! the handler registry. A misbehaving handler is logged and skipped,
//! never allowed to stall ingestion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::event::{ControlSignal, Envelope, Payload, Record, Target};
use crate::handlers::HandlerRegistry;
use crate::objects::ObjectRegistry;
use crate::schema::Schema;
use crate::source::SourceMap;

enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Dispatcher {
    pub(crate) evq: mpsc::Receiver<Envelope>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) schema: Arc<dyn Schema>,
    pub(crate) sources: Arc<SourceMap>,
    pub(crate) objects: Arc<ObjectRegistry>,
    pub(crate) ready: watch::Sender<bool>,
    /// Initial sources still expected to report `SyncStarted`.
    pub(crate) countdown: usize,
    pub(crate) gc_interval: Duration,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        if self.countdown == 0 {
            let _ = self.ready.send(true);
        }
        let mut last_sweep = Instant::now();

        while let Some(envelope) = self.evq.recv().await {
            let Envelope { target, items } = envelope;
            for item in items {
                match item {
                    Payload::Signal(signal) => {
                        if matches!(self.handle_signal(&target, signal), Flow::Exit) {
                            info!("dispatcher exiting");
                            return;
                        }
                    }
                    Payload::Record(record) => self.dispatch_record(&target, &record),
                }
            }

            if last_sweep.elapsed() >= self.gc_interval {
                last_sweep = Instant::now();
                let dropped = self.objects.sweep();
                if dropped > 0 {
                    debug!(dropped, "swept dead object references");
                }
            }
        }

        debug!("event queue closed, dispatcher exiting");
    }

    fn handle_signal(&mut self, target: &Target, signal: ControlSignal) -> Flow {
        match signal {
            ControlSignal::SchemaFlush => {
                if let Err(err) = self.schema.flush(target) {
                    error!(target = %target, error = %err, "schema flush failed");
                }
            }
            ControlSignal::MarkFailed => {
                if let Err(err) = self.schema.mark(target, 1) {
                    error!(target = %target, error = %err, "schema mark failed");
                }
            }
            ControlSignal::SyncStarted => {
                self.countdown = self.countdown.saturating_sub(1);
                if self.countdown == 0 {
                    let _ = self.ready.send(true);
                }
            }
            ControlSignal::Barrier(gate) | ControlSignal::Ready(gate) => {
                // Everything enqueued before this signal has been
                // applied; release the waiter.
                gate.notify_one();
            }
            ControlSignal::ShutdownAll => {
                // Mark every source for shutdown; the dispatcher itself
                // keeps draining until ExitDispatcher.
                for source in self.sources.all() {
                    source.request_shutdown();
                }
            }
            ControlSignal::ExitDispatcher => return Flow::Exit,
        }
        Flow::Continue
    }

    fn dispatch_record(&self, target: &Target, record: &Record) {
        let invoked = self.registry.dispatch(target, record);
        if invoked == 0 {
            warn!(kind = %record.kind, "unsupported event ignored");
        }
    }
}
