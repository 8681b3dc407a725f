//! Handler registry: event kind to ordered handler chains.
//!
//! Two handler classes share one registry: schema-level handlers,
//! registered at startup and alive for the engine's lifetime, and
//! object-level weak handlers that self-invalidate once their proxy
//! object has been dropped. Registration order is invocation order, so
//! schema handlers materialize rows before any object-level subscriber
//! observes the event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::event::{EventKind, Record, Target};

/// Error returned by an event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler's weak referent is gone; the dispatcher removes the
    /// handler and continues. Expected and frequent, not a failure.
    #[error("handler referent is gone")]
    Invalidated,

    /// The handler itself failed; logged, never fatal to ingestion.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// An event handler callback.
pub type Handler = Box<dyn FnMut(&Target, &Record) -> std::result::Result<(), HandlerError> + Send>;

/// Identity of one registered handler, for `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct HandlerEntry {
    id: HandlerId,
    // Individually locked so the registry lock is never held while
    // user code runs.
    func: Arc<Mutex<Handler>>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    chains: HashMap<EventKind, Vec<HandlerEntry>>,
}

/// Thread-safe mapping from event kind to an ordered handler chain.
///
/// API threads register and unregister; only the dispatcher invokes.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the chain for `kind`.
    pub fn register(&self, kind: EventKind, handler: Handler) -> HandlerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = HandlerId(inner.next_id);
        inner.chains.entry(kind).or_default().push(HandlerEntry {
            id,
            func: Arc::new(Mutex::new(handler)),
        });
        id
    }

    /// Removes a handler by identity.
    pub fn unregister(&self, kind: EventKind, id: HandlerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let chain = inner
            .chains
            .get_mut(&kind)
            .ok_or(Error::NoSuchHandler(kind))?;
        let before = chain.len();
        chain.retain(|entry| entry.id != id);
        if chain.len() == before {
            return Err(Error::NoSuchHandler(kind));
        }
        Ok(())
    }

    /// Number of handlers currently registered for `kind`.
    pub fn len(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .chains
            .get(&kind)
            .map_or(0, |chain| chain.len())
    }

    /// Returns true if no handler is registered for `kind`.
    pub fn is_empty(&self, kind: EventKind) -> bool {
        self.len(kind) == 0
    }

    /// Invokes the chain for the record's kind, in registration order.
    ///
    /// Invalidated handlers are removed from the chain; any other
    /// handler error is logged with context and dispatch continues.
    /// Returns the number of handlers invoked.
    pub(crate) fn dispatch(&self, target: &Target, record: &Record) -> usize {
        // Snapshot the chain so the registry lock is released before
        // any handler runs; handlers may register new subscriptions.
        let snapshot: Vec<HandlerEntry> = self
            .inner
            .lock()
            .chains
            .get(&record.kind)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            return 0;
        }

        let mut dead: Vec<HandlerId> = Vec::new();
        for entry in &snapshot {
            let mut func = entry.func.lock();
            let handler = &mut *func;
            match handler(target, record) {
                Ok(()) => {}
                Err(HandlerError::Invalidated) => dead.push(entry.id),
                Err(HandlerError::Failed(err)) => {
                    error!(
                        target = %target,
                        kind = %record.kind,
                        error = %err,
                        "event handler failed"
                    );
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            if let Some(chain) = inner.chains.get_mut(&record.kind) {
                chain.retain(|entry| !dead.contains(&entry.id));
            }
            debug!(
                kind = %record.kind,
                removed = dead.len(),
                "removed invalidated handlers"
            );
        }

        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_register_and_dispatch() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::Link, counting_handler(counter.clone()));
        registry.register(EventKind::Link, counting_handler(counter.clone()));

        let rec = Record::set(EventKind::Link).with("ifname", "eth0");
        let invoked = registry.dispatch(&Target::localhost(), &rec);

        assert_eq!(invoked, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_preserves_registration_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.register(
                EventKind::Route,
                Box::new(move |_, _| {
                    order.lock().push(tag);
                    Ok(())
                }),
            );
        }

        registry.dispatch(&Target::localhost(), &Record::set(EventKind::Route));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unregister_missing_fails() {
        let registry = HandlerRegistry::new();
        let id = registry.register(EventKind::Link, Box::new(|_, _| Ok(())));
        assert!(registry.unregister(EventKind::Link, id).is_ok());
        assert!(matches!(
            registry.unregister(EventKind::Link, id),
            Err(Error::NoSuchHandler(EventKind::Link))
        ));
    }

    #[test]
    fn test_invalidated_handler_removed() {
        let registry = HandlerRegistry::new();
        registry.register(
            EventKind::Neighbour,
            Box::new(|_, _| Err(HandlerError::Invalidated)),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::Neighbour, counting_handler(counter.clone()));

        let rec = Record::set(EventKind::Neighbour);
        registry.dispatch(&Target::localhost(), &rec);

        // The invalidated handler is removed; the live one survives.
        assert_eq!(registry.len(EventKind::Neighbour), 1);
        registry.dispatch(&Target::localhost(), &rec);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_handler_does_not_stall_chain() {
        let registry = HandlerRegistry::new();
        registry.register(
            EventKind::Address,
            Box::new(|_, _| Err(HandlerError::Failed(anyhow::anyhow!("boom")))),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::Address, counting_handler(counter.clone()));

        registry.dispatch(&Target::localhost(), &Record::set(EventKind::Address));

        // The failing handler stays registered and the chain continues.
        assert_eq!(registry.len(EventKind::Address), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
