//! Event envelopes: the unit of work flowing from sources to the dispatcher.
//!
//! An [`Envelope`] carries the identifier of its originating source (the
//! [`Target`]) plus an ordered batch of payload items. A payload item is
//! either a state-change [`Record`] or a [`ControlSignal`]; the two are
//! distinguished by the [`Payload`] discriminant, never by downcasting.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Identifier of one network-state source (a node name or UUID).
///
/// The target keys the `Source` instance, every store row belonging to
/// that source, and the origin field of every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// Creates a target from any name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default target for the local kernel.
    pub fn localhost() -> Self {
        Self("localhost".to_string())
    }

    /// Returns the target name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// The class of state a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Network interfaces (links).
    Link,
    /// IP addresses.
    Address,
    /// Routing table entries.
    Route,
    /// Neighbour (ARP/NDP) table entries.
    Neighbour,
}

impl EventKind {
    /// All event kinds, in snapshot-load order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Link,
        EventKind::Address,
        EventKind::Neighbour,
        EventKind::Route,
    ];

    /// Returns the kind name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Link => "link",
            EventKind::Address => "address",
            EventKind::Route => "route",
            EventKind::Neighbour => "neighbour",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a record asserts or retracts a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOp {
    /// Add or update the row.
    Set,
    /// Remove the row.
    Del,
}

/// One state-change record: a typed bag of field values.
///
/// The wire decoding that produces records is the provider's concern;
/// the engine treats fields as opaque named values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The class of state described.
    pub kind: EventKind,
    /// Set or Del.
    pub op: RecordOp,
    /// Field name to value.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates a Set record with no fields.
    pub fn set(kind: EventKind) -> Self {
        Self {
            kind,
            op: RecordOp::Set,
            fields: BTreeMap::new(),
        }
    }

    /// Creates a Del record with no fields.
    pub fn del(kind: EventKind) -> Self {
        Self {
            kind,
            op: RecordOp::Del,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field (builder style).
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Returns a field value, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Tests the record against an exact field-match specification.
    ///
    /// Every entry of `spec` must be present and equal, either as a raw
    /// value or in normalized (textual) representation, so `24` matches
    /// `"24"`.
    pub fn matches(&self, spec: &BTreeMap<String, Value>) -> bool {
        spec.iter().all(|(field, expected)| {
            self.get(field)
                .is_some_and(|actual| values_equal(expected, actual))
        })
    }
}

/// Compares two field values, accepting a normalized textual match.
pub(crate) fn values_equal(expected: &Value, actual: &Value) -> bool {
    expected == actual || value_text(expected) == value_text(actual)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Control signals multiplexed through the event queue.
///
/// A closed set of sentinel kinds dispatched by discriminant through the
/// same path as data records.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    /// Discard and reload all rows for the envelope's target.
    SchemaFlush,
    /// Flag all rows for the envelope's target as stale.
    MarkFailed,
    /// Request cooperative shutdown of every source; the dispatcher
    /// keeps running.
    ShutdownAll,
    /// Terminate the dispatcher loop.
    ExitDispatcher,
    /// One initial source finished its first load.
    SyncStarted,
    /// Drain barrier: the dispatcher signals it once every earlier
    /// message from the same source has been applied.
    Barrier(Arc<Notify>),
    /// Caller-supplied readiness signal, relayed once the source is live.
    Ready(Arc<Notify>),
}

impl ControlSignal {
    /// Returns the signal name, for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::SchemaFlush => "schema-flush",
            ControlSignal::MarkFailed => "mark-failed",
            ControlSignal::ShutdownAll => "shutdown-all",
            ControlSignal::ExitDispatcher => "exit-dispatcher",
            ControlSignal::SyncStarted => "sync-started",
            ControlSignal::Barrier(_) => "barrier",
            ControlSignal::Ready(_) => "ready",
        }
    }
}

/// One payload item of an envelope.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A state-change record.
    Record(Record),
    /// A control signal.
    Signal(ControlSignal),
}

/// The queued unit of work: an origin target plus ordered payload items.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Originating source.
    pub target: Target,
    /// Payload items, applied in order.
    pub items: Vec<Payload>,
}

impl Envelope {
    /// Wraps a batch of records from one source.
    pub fn records(target: Target, records: Vec<Record>) -> Self {
        Self {
            target,
            items: records.into_iter().map(Payload::Record).collect(),
        }
    }

    /// Wraps a single control signal.
    pub fn signal(target: Target, signal: ControlSignal) -> Self {
        Self {
            target,
            items: vec![Payload::Signal(signal)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_builder() {
        let rec = Record::set(EventKind::Link)
            .with("ifname", "eth0")
            .with("mtu", 1500);

        assert_eq!(rec.op, RecordOp::Set);
        assert_eq!(rec.get("ifname"), Some(&json!("eth0")));
        assert_eq!(rec.get("mtu"), Some(&json!(1500)));
        assert_eq!(rec.get("missing"), None);
    }

    #[test]
    fn test_record_matches_exact() {
        let rec = Record::set(EventKind::Address)
            .with("address", "10.0.0.1")
            .with("prefixlen", 24);

        let mut spec = BTreeMap::new();
        spec.insert("address".to_string(), json!("10.0.0.1"));
        assert!(rec.matches(&spec));

        spec.insert("prefixlen".to_string(), json!(16));
        assert!(!rec.matches(&spec));
    }

    #[test]
    fn test_record_matches_normalized() {
        let rec = Record::set(EventKind::Address).with("prefixlen", 24);

        // A textual "24" matches the numeric field value.
        let mut spec = BTreeMap::new();
        spec.insert("prefixlen".to_string(), json!("24"));
        assert!(rec.matches(&spec));
    }

    #[test]
    fn test_record_matches_missing_field() {
        let rec = Record::set(EventKind::Link).with("ifname", "eth0");

        let mut spec = BTreeMap::new();
        spec.insert("kind".to_string(), json!("dummy"));
        assert!(!rec.matches(&spec));
    }

    #[test]
    fn test_envelope_constructors() {
        let env = Envelope::records(
            Target::localhost(),
            vec![Record::set(EventKind::Link), Record::del(EventKind::Link)],
        );
        assert_eq!(env.items.len(), 2);

        let env = Envelope::signal(Target::new("remote"), ControlSignal::SchemaFlush);
        assert_eq!(env.items.len(), 1);
        assert!(matches!(
            env.items[0],
            Payload::Signal(ControlSignal::SchemaFlush)
        ));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::localhost().to_string(), "localhost");
        assert_eq!(Target::from("netns0").as_str(), "netns0");
    }
}
