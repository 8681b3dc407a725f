//! The convergence wait protocol.
//!
//! `wait` blocks its caller until a set of state conditions holds,
//! racing a short-lived event subscription against direct store
//! polling. The subscription is a latency optimization only: its side
//! queue drops on overflow and correctness always falls back to the
//! next store check.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{EventKind, Record, Target};
use crate::handlers::{HandlerId, HandlerRegistry};
use crate::objects::{where_clause, ObjectKind};
use crate::schema::Schema;
use crate::source::{SourceMap, SourceState};

/// Capacity of the side queue feeding `wait`; overflow is dropped.
const WAIT_QUEUE_DEPTH: usize = 512;

/// Store polling interval while waiting.
const WAIT_POLL: Duration = Duration::from_secs(1);

/// A set of state conditions to wait for.
///
/// Each condition names an object kind and an exact field match,
/// optionally scoped to a `target` (default `localhost`). Conditions
/// are satisfied independently, by an incoming matching event or by a
/// direct store lookup.
#[derive(Debug, Clone, Default)]
pub struct WaitSpec {
    entries: Vec<(ObjectKind, BTreeMap<String, Value>)>,
}

impl WaitSpec {
    /// An empty specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one condition.
    pub fn condition(mut self, kind: ObjectKind, fields: BTreeMap<String, Value>) -> Self {
        self.entries.push((kind, fields));
        self
    }

    /// Shorthand: wait for an interface by name.
    pub fn interface(self, ifname: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("ifname".to_string(), Value::String(ifname.into()));
        self.condition(ObjectKind::Interfaces, fields)
    }

    /// Shorthand: wait for an address by value and prefix length.
    pub fn address(self, address: impl Into<String>, prefixlen: i64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("address".to_string(), Value::String(address.into()));
        fields.insert("prefixlen".to_string(), Value::from(prefixlen));
        self.condition(ObjectKind::Addresses, fields)
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no condition is listed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Unregisters the temporary subscriptions on every exit path,
/// including cancellation of the `wait` future itself.
struct TempHandlers<'a> {
    registry: &'a HandlerRegistry,
    handlers: Vec<(EventKind, HandlerId)>,
}

impl Drop for TempHandlers<'_> {
    fn drop(&mut self) {
        for (kind, id) in self.handlers.drain(..) {
            let _ = self.registry.unregister(kind, id);
        }
    }
}

pub(crate) async fn wait(
    registry: &Arc<HandlerRegistry>,
    sources: &Arc<SourceMap>,
    schema: &Arc<dyn Schema>,
    spec: WaitSpec,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<(Target, Record)>(WAIT_QUEUE_DEPTH);

    // One temporary handler per listed event kind. The handler only
    // ever best-effort enqueues: losing an event costs a poll interval,
    // never correctness.
    let mut temp = TempHandlers {
        registry: registry.as_ref(),
        handlers: Vec::new(),
    };
    let mut seen = HashSet::new();
    for (kind, _) in &spec.entries {
        let event_kind = kind.event_kind();
        if !seen.insert(event_kind) {
            continue;
        }
        let tx = tx.clone();
        let id = registry.register(
            event_kind,
            Box::new(move |target, record| {
                let _ = tx.try_send((target.clone(), record.clone()));
                Ok(())
            }),
        );
        temp.handlers.push((event_kind, id));
    }
    drop(tx);

    let mut pending = spec.entries;
    run(schema, sources, &mut rx, &mut pending).await
}

async fn run(
    schema: &Arc<dyn Schema>,
    sources: &Arc<SourceMap>,
    rx: &mut mpsc::Receiver<(Target, Record)>,
    pending: &mut Vec<(ObjectKind, BTreeMap<String, Value>)>,
) -> Result<()> {
    check_store(schema, sources, pending)?;

    while !pending.is_empty() {
        let message = tokio::time::timeout(WAIT_POLL, rx.recv()).await;
        // Poll the store on every pull and on every timeout; this is
        // the path that guarantees forward progress.
        check_store(schema, sources, pending)?;
        match message {
            Ok(Some((target, record))) => {
                pending.retain(|(kind, cond)| !event_satisfies(*kind, cond, &target, &record));
            }
            Ok(None) => tokio::time::sleep(WAIT_POLL).await,
            Err(_) => {}
        }
    }
    Ok(())
}

fn check_store(
    schema: &Arc<dyn Schema>,
    sources: &Arc<SourceMap>,
    pending: &mut Vec<(ObjectKind, BTreeMap<String, Value>)>,
) -> Result<()> {
    let mut remaining = Vec::with_capacity(pending.len());
    for (kind, cond) in pending.drain(..) {
        let target = cond
            .get("target")
            .and_then(Value::as_str)
            .map(Target::from)
            .unwrap_or_else(Target::localhost);
        let source = sources
            .get(&target)
            .ok_or_else(|| Error::UnknownSource(target.clone()))?;
        if source.state() != SourceState::Running {
            return Err(Error::SourceNotRunning(target));
        }
        if !satisfied(schema, kind, &cond)? {
            remaining.push((kind, cond));
        }
    }
    *pending = remaining;
    Ok(())
}

fn satisfied(
    schema: &Arc<dyn Schema>,
    kind: ObjectKind,
    cond: &BTreeMap<String, Value>,
) -> Result<bool> {
    let (clause, params) = where_clause(&**schema, kind, cond)?;
    let query = format!("SELECT * FROM {}{}", kind.table(), clause);
    let rows = schema.fetch(&query, &params).map_err(Error::schema)?;
    Ok(!rows.is_empty())
}

/// Structural in-queue match: `target` compares literally, other fields
/// against either the raw or the normalized representation.
fn event_satisfies(
    kind: ObjectKind,
    cond: &BTreeMap<String, Value>,
    target: &Target,
    record: &Record,
) -> bool {
    if record.kind != kind.event_kind() {
        return false;
    }
    let mut fields = cond.clone();
    if let Some(expected) = fields.remove("target") {
        if expected.as_str() != Some(target.as_str()) {
            return false;
        }
    }
    record.matches(&fields)
}
