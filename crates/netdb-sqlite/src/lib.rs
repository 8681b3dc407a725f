//! SQLite store backend for the netdb mirror engine.
//!
//! One table per event kind, keyed by `(target, natural key)`, plus
//! `vlan` and `bridge` views filtered off the interfaces table. The
//! connection is guarded by a mutex; the dispatcher task and API
//! threads call concurrently.

mod codec;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::{debug, warn};

use netdb::{EventKind, ObjectKind, Record, RecordOp, Row, Schema, Target};

const INTERFACE_COLUMNS: &[&str] = &[
    "target", "tflags", "ifindex", "ifname", "kind", "state", "mtu", "address",
];
const ADDRESS_COLUMNS: &[&str] = &["target", "tflags", "ifindex", "address", "prefixlen"];
const ROUTE_COLUMNS: &[&str] = &[
    "target", "tflags", "family", "dst", "dst_len", "gateway", "oif", "priority", "rtable",
];
const NEIGHBOUR_COLUMNS: &[&str] = &["target", "tflags", "ifindex", "dst", "lladdr", "state"];

const TABLES: &[&str] = &["interfaces", "addresses", "routes", "neighbours"];

const DDL: &str = "
CREATE TABLE IF NOT EXISTS interfaces (
    target TEXT NOT NULL,
    tflags INTEGER NOT NULL DEFAULT 0,
    ifindex INTEGER,
    ifname TEXT NOT NULL,
    kind TEXT,
    state TEXT,
    mtu INTEGER,
    address TEXT,
    PRIMARY KEY (target, ifname)
);
CREATE TABLE IF NOT EXISTS addresses (
    target TEXT NOT NULL,
    tflags INTEGER NOT NULL DEFAULT 0,
    ifindex INTEGER,
    address TEXT NOT NULL,
    prefixlen INTEGER NOT NULL,
    PRIMARY KEY (target, address, prefixlen)
);
CREATE TABLE IF NOT EXISTS routes (
    target TEXT NOT NULL,
    tflags INTEGER NOT NULL DEFAULT 0,
    family INTEGER,
    dst TEXT NOT NULL,
    dst_len INTEGER NOT NULL,
    gateway TEXT,
    oif INTEGER,
    priority INTEGER,
    rtable INTEGER,
    PRIMARY KEY (target, dst, dst_len)
);
CREATE TABLE IF NOT EXISTS neighbours (
    target TEXT NOT NULL,
    tflags INTEGER NOT NULL DEFAULT 0,
    ifindex INTEGER NOT NULL,
    dst TEXT NOT NULL,
    lladdr TEXT,
    state TEXT,
    PRIMARY KEY (target, ifindex, dst)
);
CREATE VIEW IF NOT EXISTS vlan AS SELECT * FROM interfaces WHERE kind = 'vlan';
CREATE VIEW IF NOT EXISTS bridge AS SELECT * FROM interfaces WHERE kind = 'bridge';
";

/// SQLite-backed implementation of the store contract.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Opens (and initializes) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening store at {}", path.as_ref().display()))?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(DDL).context("initializing store layout")?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, body: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(|| anyhow!("store is closed"))?;
        body(conn)
    }

    fn kind_for(event: EventKind) -> ObjectKind {
        match event {
            EventKind::Link => ObjectKind::Interfaces,
            EventKind::Address => ObjectKind::Addresses,
            EventKind::Route => ObjectKind::Routes,
            EventKind::Neighbour => ObjectKind::Neighbours,
        }
    }

    fn upsert(&self, target: &Target, kind: ObjectKind, record: &Record) -> Result<()> {
        let columns = self.columns(kind);
        let mut names = vec!["target"];
        let mut params = vec![Value::String(target.to_string())];
        for (field, value) in &record.fields {
            // Fields the layout does not know are dropped, not fatal;
            // providers may decode more attributes than we mirror.
            if columns.contains(&field.as_str()) {
                names.push(field.as_str());
                params.push(value.clone());
            }
        }

        let mut conflict = vec!["target"];
        conflict.extend_from_slice(self.key_fields(kind));
        for &key in self.key_fields(kind) {
            if !names.contains(&key) {
                debug!(kind = %kind, key, "record without a full key ignored");
                return Ok(());
            }
        }

        // Deltas update only the columns they carry; everything else on
        // the row is preserved.
        let updates: Vec<String> = names
            .iter()
            .filter(|name| !conflict.contains(name))
            .map(|name| format!("{name} = excluded.{name}"))
            .collect();
        let action = if updates.is_empty() {
            "NOTHING".to_string()
        } else {
            format!("UPDATE SET {}", updates.join(", "))
        };
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO {}",
            kind.table(),
            names.join(", "),
            vec!["?"; names.len()].join(", "),
            conflict.join(", "),
            action
        );
        self.execute(&query, &params)
    }

    fn delete(&self, target: &Target, kind: ObjectKind, record: &Record) -> Result<()> {
        let mut conditions = vec!["target = ?".to_string()];
        let mut params = vec![Value::String(target.to_string())];
        for &key in self.key_fields(kind) {
            match record.get(key) {
                Some(value) => {
                    conditions.push(format!("{key} = ?"));
                    params.push(value.clone());
                }
                None => {
                    debug!(kind = %kind, key, "deletion without a full key ignored");
                    return Ok(());
                }
            }
        }
        let query = format!(
            "DELETE FROM {} WHERE {}",
            kind.table(),
            conditions.join(" AND ")
        );
        self.execute(&query, &params)
    }
}

impl Schema for SqliteStore {
    fn apply(&self, target: &Target, record: &Record) -> Result<()> {
        let kind = Self::kind_for(record.kind);
        match record.op {
            RecordOp::Set => self.upsert(target, kind, record),
            RecordOp::Del => self.delete(target, kind, record),
        }
    }

    fn flush(&self, target: &Target) -> Result<()> {
        self.with_conn(|conn| {
            for table in TABLES {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE target = ?"),
                    [target.as_str()],
                )?;
            }
            Ok(())
        })
    }

    fn mark(&self, target: &Target, flag: i64) -> Result<()> {
        warn!(target = %target, flag, "flagging rows of a failed source");
        self.with_conn(|conn| {
            for table in TABLES {
                conn.execute(
                    &format!("UPDATE {table} SET tflags = ? WHERE target = ?"),
                    rusqlite::params![flag, target.as_str()],
                )?;
            }
            Ok(())
        })
    }

    fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(query)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter().map(codec::to_sql)))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for index in 0..width {
                    values.push(codec::from_sql(row.get_ref(index)?));
                }
                out.push(values);
            }
            Ok(out)
        })
    }

    fn execute(&self, query: &str, params: &[Value]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(query, params_from_iter(params.iter().map(codec::to_sql)))?;
            Ok(())
        })
    }

    fn columns(&self, kind: ObjectKind) -> &[&str] {
        match kind {
            ObjectKind::Interfaces | ObjectKind::Vlan | ObjectKind::Bridge => INTERFACE_COLUMNS,
            ObjectKind::Addresses => ADDRESS_COLUMNS,
            ObjectKind::Routes => ROUTE_COLUMNS,
            ObjectKind::Neighbours => NEIGHBOUR_COLUMNS,
        }
    }

    fn key_fields(&self, kind: ObjectKind) -> &[&str] {
        match kind {
            ObjectKind::Interfaces | ObjectKind::Vlan | ObjectKind::Bridge => &["ifname"],
            ObjectKind::Addresses => &["address", "prefixlen"],
            ObjectKind::Routes => &["dst", "dst_len"],
            ObjectKind::Neighbours => &["ifindex", "dst"],
        }
    }

    fn placeholder(&self) -> &str {
        "?"
    }

    fn commit(&self) -> Result<()> {
        // The connection runs in autocommit mode.
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, err)| err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn eth0() -> Record {
        Record::set(EventKind::Link)
            .with("ifname", "eth0")
            .with("ifindex", 2)
            .with("mtu", 1500)
            .with("state", "up")
    }

    #[test]
    fn test_set_then_fetch() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();

        let rows = store
            .fetch("SELECT ifname, mtu FROM interfaces", &[])
            .unwrap();
        assert_eq!(rows, vec![vec![json!("eth0"), json!(1500)]]);
    }

    #[test]
    fn test_reapply_updates_row() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store
            .apply(&Target::localhost(), &eth0().with("mtu", 9000))
            .unwrap();

        let rows = store.fetch("SELECT mtu FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!(9000)]]);
    }

    #[test]
    fn test_delta_preserves_unsupplied_columns() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();

        // A delta carries only the changed field plus the key.
        let delta = Record::set(EventKind::Link)
            .with("ifname", "eth0")
            .with("state", "down");
        store.apply(&Target::localhost(), &delta).unwrap();

        let rows = store
            .fetch("SELECT mtu, ifindex, state FROM interfaces", &[])
            .unwrap();
        assert_eq!(rows, vec![vec![json!(1500), json!(2), json!("down")]]);
    }

    #[test]
    fn test_key_only_record_is_a_no_op_update() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store
            .apply(
                &Target::localhost(),
                &Record::set(EventKind::Link).with("ifname", "eth0"),
            )
            .unwrap();

        let rows = store.fetch("SELECT mtu FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!(1500)]]);
    }

    #[test]
    fn test_del_removes_by_key() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store
            .apply(
                &Target::localhost(),
                &Record::del(EventKind::Link).with("ifname", "eth0"),
            )
            .unwrap();

        let rows = store.fetch("SELECT * FROM interfaces", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_incomplete_key_ignored() {
        let store = store();
        let keyless = Record::set(EventKind::Link).with("mtu", 1500);
        store.apply(&Target::localhost(), &keyless).unwrap();
        assert!(store.fetch("SELECT * FROM interfaces", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_flush_scoped_to_target() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store
            .apply(&Target::new("remote"), &eth0().with("ifname", "ix0"))
            .unwrap();

        store.flush(&Target::localhost()).unwrap();
        let rows = store.fetch("SELECT target FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!("remote")]]);
    }

    #[test]
    fn test_mark_flags_rows() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store.mark(&Target::localhost(), 1).unwrap();

        let rows = store.fetch("SELECT tflags FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!(1)]]);
    }

    #[test]
    fn test_vlan_view_filters_interfaces() {
        let store = store();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store
            .apply(
                &Target::localhost(),
                &Record::set(EventKind::Link)
                    .with("ifname", "vlan100")
                    .with("kind", "vlan"),
            )
            .unwrap();

        let rows = store.fetch("SELECT ifname FROM vlan", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!("vlan100")]]);
    }

    #[test]
    fn test_address_composite_key() {
        let store = store();
        let addr = Record::set(EventKind::Address)
            .with("address", "10.0.0.1")
            .with("prefixlen", 24)
            .with("ifindex", 2);
        store.apply(&Target::localhost(), &addr).unwrap();
        store
            .apply(
                &Target::localhost(),
                &Record::set(EventKind::Address)
                    .with("address", "10.0.0.1")
                    .with("prefixlen", 16),
            )
            .unwrap();

        let rows = store.fetch("SELECT count(*) FROM addresses", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!(2)]]);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");

        let store = SqliteStore::open(&path).unwrap();
        store.apply(&Target::localhost(), &eth0()).unwrap();
        store.close().unwrap();

        let reopened = SqliteStore::open(&path).unwrap();
        let rows = reopened.fetch("SELECT ifname FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![json!("eth0")]]);
    }

    #[test]
    fn test_close_is_final() {
        let store = store();
        store.close().unwrap();
        assert!(store.fetch("SELECT 1", &[]).is_err());
        // A second close is a no-op.
        store.close().unwrap();
    }
}
