//! Query-backed proxy objects and the factory that produces them.
//!
//! A [`View`] constructs an ephemeral [`Proxy`] on every access: two
//! proxies obtained for the same key are distinct instances with
//! independent identity, both keyed back to the store by kind plus key
//! specification. Each proxy subscribes to live updates through a weak
//! handler that self-invalidates once the proxy has been dropped; the
//! dispatcher notices the death at its next periodic sweep. The store
//! stays the single source of truth: every proxy read re-queries it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{EventKind, Record, Target};
use crate::handlers::{HandlerError, HandlerRegistry};
use crate::report::Report;
use crate::schema::Schema;

/// The object classes the factory can produce.
///
/// `Vlan` and `Bridge` are interface views: they share the link event
/// stream and the interface key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Network interfaces.
    Interfaces,
    /// VLAN interfaces (a view over interfaces).
    Vlan,
    /// Bridge interfaces (a view over interfaces).
    Bridge,
    /// IP addresses.
    Addresses,
    /// Routing table entries.
    Routes,
    /// Neighbour table entries.
    Neighbours,
}

impl ObjectKind {
    /// All object kinds.
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Interfaces,
        ObjectKind::Vlan,
        ObjectKind::Bridge,
        ObjectKind::Addresses,
        ObjectKind::Routes,
        ObjectKind::Neighbours,
    ];

    /// The store table (or view) this kind reads from.
    pub fn table(self) -> &'static str {
        match self {
            ObjectKind::Interfaces => "interfaces",
            ObjectKind::Vlan => "vlan",
            ObjectKind::Bridge => "bridge",
            ObjectKind::Addresses => "addresses",
            ObjectKind::Routes => "routes",
            ObjectKind::Neighbours => "neighbours",
        }
    }

    /// The event kind this object class subscribes to.
    pub fn event_kind(self) -> EventKind {
        match self {
            ObjectKind::Interfaces | ObjectKind::Vlan | ObjectKind::Bridge => EventKind::Link,
            ObjectKind::Addresses => EventKind::Address,
            ObjectKind::Routes => EventKind::Route,
            ObjectKind::Neighbours => EventKind::Neighbour,
        }
    }

    /// The field a plain-string key addresses.
    pub fn key_field(self) -> &'static str {
        match self {
            ObjectKind::Interfaces | ObjectKind::Vlan | ObjectKind::Bridge => "ifname",
            ObjectKind::Addresses => "address",
            ObjectKind::Routes => "dst",
            ObjectKind::Neighbours => "dst",
        }
    }
}

impl fmt::Display for ObjectKind {
    // The table name doubles as the public view name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.table() == name)
            .ok_or_else(|| Error::UnknownField(name.to_string()))
    }
}

/// A proxy lookup key: either the kind's natural key or a full field
/// match specification.
#[derive(Debug, Clone)]
pub enum Key {
    /// Look up by the kind's default key field.
    Name(String),
    /// Look up by explicit field matches.
    Spec(BTreeMap<String, Value>),
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<BTreeMap<String, Value>> for Key {
    fn from(spec: BTreeMap<String, Value>) -> Self {
        Key::Spec(spec)
    }
}

/// Process-wide set of weak references to live proxy objects.
///
/// The factory records every proxy it constructs; the dispatcher sweeps
/// the set periodically, dropping entries whose referent is gone.
#[derive(Default)]
pub struct ObjectRegistry {
    tracked: Mutex<Vec<Weak<ProxyInner>>>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, reference: Weak<ProxyInner>) {
        self.tracked.lock().push(reference);
    }

    /// Drops every tracked entry whose referent is dead; returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|reference| reference.strong_count() > 0);
        before - tracked.len()
    }

    /// Number of tracked references whose referent is still alive.
    pub fn live(&self) -> usize {
        self.tracked
            .lock()
            .iter()
            .filter(|reference| reference.strong_count() > 0)
            .count()
    }

    /// Total tracked references, dead ones included.
    pub fn tracked(&self) -> usize {
        self.tracked.lock().len()
    }
}

struct ProxyState {
    create: bool,
    deleted: bool,
    staged: BTreeMap<String, Value>,
    last_event: Option<Record>,
}

pub(crate) struct ProxyInner {
    kind: ObjectKind,
    key: BTreeMap<String, Value>,
    schema: Arc<dyn Schema>,
    state: Mutex<ProxyState>,
}

impl ProxyInner {
    /// Re-queries the store for this proxy's row.
    fn load(&self) -> Result<BTreeMap<String, Value>> {
        let (clause, params) = where_clause(&*self.schema, self.kind, &self.key)?;
        let query = format!("SELECT * FROM {}{}", self.kind.table(), clause);
        let rows = self.schema.fetch(&query, &params).map_err(Error::schema)?;
        let row = rows.into_iter().next().ok_or_else(|| Error::NotFound {
            kind: self.kind,
            key: render_key(&self.key),
        })?;
        Ok(self
            .schema
            .columns(self.kind)
            .iter()
            .map(|column| column.to_string())
            .zip(row)
            .collect())
    }

    /// Applied by the weak event handler: remembers the last event
    /// matching this proxy's key. A single convenience access; never a
    /// substitute for re-querying the store.
    fn apply_event(&self, target: &Target, record: &Record) {
        let mut spec = self.key.clone();
        if let Some(Value::String(key_target)) = spec.remove("target") {
            if key_target != target.as_str() {
                return;
            }
        }
        if record.matches(&spec) {
            self.state.lock().last_event = Some(record.clone());
        }
    }
}

/// Ephemeral, query-backed handle for one store row.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// The object kind.
    pub fn kind(&self) -> ObjectKind {
        self.inner.kind
    }

    /// The key specification this proxy resolves through.
    pub fn key(&self) -> &BTreeMap<String, Value> {
        &self.inner.key
    }

    /// Re-queries the store and returns the full row.
    pub fn load(&self) -> Result<BTreeMap<String, Value>> {
        self.inner.load()
    }

    /// Returns one field: a staged change if present, the stored value
    /// otherwise.
    pub fn field(&self, name: &str) -> Result<Option<Value>> {
        if let Some(staged) = self.inner.state.lock().staged.get(name) {
            return Ok(Some(staged.clone()));
        }
        if self.inner.state.lock().create {
            return Ok(self.inner.key.get(name).cloned());
        }
        Ok(self.inner.load()?.remove(name))
    }

    /// Stages a field change for the next [`Proxy::commit`].
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.inner.state.lock().staged.insert(field.into(), value.into());
    }

    /// Stages removal of the row.
    pub fn remove(&self) {
        self.inner.state.lock().deleted = true;
    }

    /// Returns true if the store currently has a matching row.
    pub fn exists(&self) -> Result<bool> {
        match self.inner.load() {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The last matching event observed by this proxy's subscription.
    pub fn last_event(&self) -> Option<Record> {
        self.inner.state.lock().last_event.clone()
    }

    /// Writes staged changes through the schema's write path.
    pub fn commit(&self) -> Result<()> {
        let schema = &self.inner.schema;
        let kind = self.inner.kind;
        let table = kind.table();
        let placeholder = schema.placeholder();
        let mut state = self.inner.state.lock();

        if state.deleted {
            let (clause, params) = where_clause(&**schema, kind, &self.inner.key)?;
            schema
                .execute(&format!("DELETE FROM {table}{clause}"), &params)
                .map_err(Error::schema)?;
            state.deleted = false;
            state.create = false;
            state.staged.clear();
        } else if state.create {
            let mut fields = self.inner.key.clone();
            fields.append(&mut state.staged);
            fields
                .entry("target".to_string())
                .or_insert_with(|| Value::String(Target::localhost().to_string()));
            let columns = schema.columns(kind);
            let mut names = Vec::with_capacity(fields.len());
            let mut params = Vec::with_capacity(fields.len());
            for (field, value) in fields {
                if !columns.contains(&field.as_str()) {
                    return Err(Error::UnknownField(field));
                }
                names.push(field);
                params.push(value);
            }
            let query = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                names.join(", "),
                vec![placeholder; params.len()].join(", ")
            );
            schema.execute(&query, &params).map_err(Error::schema)?;
            state.create = false;
        } else if !state.staged.is_empty() {
            let columns = schema.columns(kind);
            let mut assignments = Vec::with_capacity(state.staged.len());
            let mut params = Vec::with_capacity(state.staged.len());
            for (field, value) in std::mem::take(&mut state.staged) {
                if !columns.contains(&field.as_str()) {
                    return Err(Error::UnknownField(field));
                }
                assignments.push(format!("{field} = {placeholder}"));
                params.push(value);
            }
            let (clause, mut key_params) = where_clause(&**schema, kind, &self.inner.key)?;
            params.append(&mut key_params);
            let query = format!("UPDATE {table} SET {}{clause}", assignments.join(", "));
            schema.execute(&query, &params).map_err(Error::schema)?;
        }

        schema.commit().map_err(Error::schema)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.inner.kind, render_key(&self.inner.key))
    }
}

/// The factory for one object kind.
///
/// Every subscript access constructs a fresh proxy and binds it to the
/// live event stream through a weak handler.
#[derive(Clone)]
pub struct View {
    kind: ObjectKind,
    schema: Arc<dyn Schema>,
    registry: Arc<HandlerRegistry>,
    objects: Arc<ObjectRegistry>,
    match_src: Vec<Proxy>,
    match_pairs: BTreeMap<String, String>,
}

impl View {
    pub(crate) fn new(
        kind: ObjectKind,
        schema: Arc<dyn Schema>,
        registry: Arc<HandlerRegistry>,
        objects: Arc<ObjectRegistry>,
    ) -> Self {
        Self {
            kind,
            schema,
            registry,
            objects,
            match_src: Vec::new(),
            match_pairs: BTreeMap::new(),
        }
    }

    /// The object kind served by this view.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Derives a scoped view: report predicates pull the named fields
    /// from the secondary source objects, first supplier wins.
    ///
    /// `pairs` maps this view's field name to the source object's field
    /// name, so e.g. a neighbour view scoped to an interface maps
    /// `ifindex` to the interface's `ifindex`.
    pub fn scoped(
        &self,
        sources: Vec<Proxy>,
        pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> View {
        View {
            kind: self.kind,
            schema: self.schema.clone(),
            registry: self.registry.clone(),
            objects: self.objects.clone(),
            match_src: sources,
            match_pairs: pairs
                .into_iter()
                .map(|(left, right)| (left.into(), right.into()))
                .collect(),
        }
    }

    /// Returns a fresh proxy for an existing row.
    ///
    /// Errors with [`Error::NotFound`] if no row matches the key.
    pub fn get(&self, key: impl Into<Key>) -> Result<Proxy> {
        self.make_proxy(self.key_spec(key.into()), false)
    }

    /// Returns a fresh proxy carrying a creation intent: the row does
    /// not have to exist yet and all fields are staged for the first
    /// commit.
    pub fn add(&self, fields: impl Into<BTreeMap<String, Value>>) -> Result<Proxy> {
        self.make_proxy(fields.into(), true)
    }

    /// Full projection of this view's rows, optionally filtered by an
    /// exact field match.
    pub fn dump(&self, matches: Option<BTreeMap<String, Value>>) -> Result<Report> {
        let spec = self.merged_match(matches)?;
        let (clause, params) = where_clause(&*self.schema, self.kind, &spec)?;
        let query = format!("SELECT * FROM {}{}", self.kind.table(), clause);
        let rows = self.schema.fetch(&query, &params).map_err(Error::schema)?;
        Ok(Report::new(
            self.schema
                .columns(self.kind)
                .iter()
                .map(|column| column.to_string())
                .collect(),
            rows,
        ))
    }

    /// Key-column projection: target plus the kind's natural key.
    pub fn summary(&self, matches: Option<BTreeMap<String, Value>>) -> Result<Report> {
        let spec = self.merged_match(matches)?;
        let (clause, params) = where_clause(&*self.schema, self.kind, &spec)?;
        let mut header = vec!["target".to_string()];
        header.extend(
            self.schema
                .key_fields(self.kind)
                .iter()
                .map(|field| field.to_string()),
        );
        let query = format!(
            "SELECT {} FROM {}{}",
            header.join(", "),
            self.kind.table(),
            clause
        );
        let rows = self.schema.fetch(&query, &params).map_err(Error::schema)?;
        Ok(Report::new(header, rows))
    }

    /// CSV rendering of [`View::dump`].
    pub fn csv(&self, matches: Option<BTreeMap<String, Value>>) -> Result<Vec<String>> {
        Ok(self.dump(matches)?.csv())
    }

    /// Returns true if at least one row matches the given fields.
    pub(crate) fn exists(&self, spec: &BTreeMap<String, Value>) -> Result<bool> {
        let (clause, params) = where_clause(&*self.schema, self.kind, spec)?;
        let query = format!("SELECT * FROM {}{}", self.kind.table(), clause);
        let rows = self.schema.fetch(&query, &params).map_err(Error::schema)?;
        Ok(!rows.is_empty())
    }

    fn key_spec(&self, key: Key) -> BTreeMap<String, Value> {
        match key {
            Key::Name(name) => {
                let mut spec = BTreeMap::new();
                spec.insert(
                    self.kind.key_field().to_string(),
                    Value::String(name),
                );
                spec
            }
            Key::Spec(spec) => spec,
        }
    }

    fn make_proxy(&self, key: BTreeMap<String, Value>, create: bool) -> Result<Proxy> {
        let inner = Arc::new(ProxyInner {
            kind: self.kind,
            key,
            schema: self.schema.clone(),
            state: Mutex::new(ProxyState {
                create,
                deleted: false,
                staged: BTreeMap::new(),
                last_event: None,
            }),
        });

        // A missing row surfaces here, before any subscription exists.
        if !create {
            inner.load()?;
        }

        self.objects.track(Arc::downgrade(&inner));

        // The weak handler resolves the reference on every invocation;
        // once the proxy is gone it reports invalidation instead of
        // failing, and the dispatcher unlinks it.
        let reference = Arc::downgrade(&inner);
        self.registry.register(
            self.kind.event_kind(),
            Box::new(move |target, record| match reference.upgrade() {
                Some(object) => {
                    object.apply_event(target, record);
                    Ok(())
                }
                None => Err(HandlerError::Invalidated),
            }),
        );

        Ok(Proxy { inner })
    }

    fn merged_match(
        &self,
        matches: Option<BTreeMap<String, Value>>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut spec = matches.unwrap_or_default();
        for (field, source_field) in &self.match_pairs {
            for source in &self.match_src {
                match source.field(source_field) {
                    Ok(Some(value)) => {
                        spec.insert(field.clone(), value);
                        break;
                    }
                    _ => continue,
                }
            }
        }
        Ok(spec)
    }
}

pub(crate) fn where_clause(
    schema: &dyn Schema,
    kind: ObjectKind,
    spec: &BTreeMap<String, Value>,
) -> Result<(String, Vec<Value>)> {
    if spec.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let columns = schema.columns(kind);
    let mut conditions = Vec::with_capacity(spec.len());
    let mut params = Vec::with_capacity(spec.len());
    for (field, value) in spec {
        if !columns.contains(&field.as_str()) {
            return Err(Error::UnknownField(field.clone()));
        }
        conditions.push(format!("{} = {}", field, schema.placeholder()));
        params.push(value.clone());
    }
    Ok((format!(" WHERE {}", conditions.join(" AND ")), params))
}

fn render_key(key: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(key).unwrap_or_else(|_| "{}".to_string())
}
