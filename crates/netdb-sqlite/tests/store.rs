//! Engine-over-SQLite integration: proxy objects, views, reports and
//! the wait protocol against a real store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use netdb::{
    Config, Error, EventKind, NetDb, Provider, ProviderEvent, Record, Schema, SourceSpec, Target,
    WaitSpec,
};
use netdb_sqlite::SqliteStore;

/// Serves a fixed snapshot, then idles.
struct StaticProvider {
    links: Vec<Record>,
    addresses: Vec<Record>,
    neighbours: Vec<Record>,
    routes: Vec<Record>,
}

impl StaticProvider {
    fn new() -> Self {
        Self {
            links: Vec::new(),
            addresses: Vec::new(),
            neighbours: Vec::new(),
            routes: Vec::new(),
        }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    async fn bind(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn links(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(self.links.clone())
    }

    async fn addresses(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(self.addresses.clone())
    }

    async fn neighbours(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(self.neighbours.clone())
    }

    async fn routes(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(self.routes.clone())
    }

    async fn next_event(&mut self) -> anyhow::Result<ProviderEvent> {
        std::future::pending().await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn lab_provider() -> StaticProvider {
    let mut provider = StaticProvider::new();
    provider.links = vec![
        Record::set(EventKind::Link)
            .with("ifname", "eth0")
            .with("ifindex", 2)
            .with("mtu", 1500)
            .with("state", "up"),
        Record::set(EventKind::Link)
            .with("ifname", "br0")
            .with("ifindex", 3)
            .with("kind", "bridge"),
    ];
    provider.addresses = vec![Record::set(EventKind::Address)
        .with("address", "10.0.0.1")
        .with("prefixlen", 24)
        .with("ifindex", 2)];
    provider.neighbours = vec![
        Record::set(EventKind::Neighbour)
            .with("ifindex", 2)
            .with("dst", "10.0.0.2")
            .with("lladdr", "aa:bb:cc:dd:ee:ff"),
        Record::set(EventKind::Neighbour)
            .with("ifindex", 3)
            .with("dst", "10.0.1.2"),
    ];
    provider.routes = vec![Record::set(EventKind::Route)
        .with("dst", "10.1.0.0")
        .with("dst_len", 16)
        .with("gateway", "10.0.0.254")
        .with("oif", 2)];
    provider
}

async fn lab_db() -> NetDb {
    let store: Arc<dyn Schema> = Arc::new(SqliteStore::in_memory().unwrap());
    NetDb::new(
        store,
        vec![(
            Target::localhost(),
            SourceSpec::handle(Box::new(lab_provider())),
        )],
        Config::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_snapshot_queryable_through_proxies() {
    let db = lab_db().await;

    let eth0 = db.interfaces().get("eth0").unwrap();
    assert_eq!(eth0.field("mtu").unwrap(), Some(json!(1500)));
    assert_eq!(eth0.field("state").unwrap(), Some(json!("up")));

    let route = db
        .routes()
        .get(BTreeMap::from([
            ("dst".to_string(), json!("10.1.0.0")),
            ("dst_len".to_string(), json!(16)),
        ]))
        .unwrap();
    assert_eq!(route.field("gateway").unwrap(), Some(json!("10.0.0.254")));

    assert!(matches!(
        db.interfaces().get("wlan0"),
        Err(Error::NotFound { .. })
    ));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_proxies_are_distinct_but_agree() {
    let db = lab_db().await;

    let first = db.interfaces().get("eth0").unwrap();
    let second = db.interfaces().get("eth0").unwrap();
    assert_eq!(first.load().unwrap(), second.load().unwrap());

    // Staged changes are per proxy instance until committed.
    first.set("mtu", 9000);
    assert_eq!(first.field("mtu").unwrap(), Some(json!(9000)));
    assert_eq!(second.field("mtu").unwrap(), Some(json!(1500)));

    first.commit().unwrap();
    assert_eq!(second.field("mtu").unwrap(), Some(json!(9000)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_proxy_create_and_remove() {
    let db = lab_db().await;

    let dummy = db
        .interfaces()
        .add(BTreeMap::from([("ifname".to_string(), json!("dummy0"))]))
        .unwrap();
    assert!(!dummy.exists().unwrap());
    dummy.set("mtu", 1400);
    dummy.commit().unwrap();
    assert!(dummy.exists().unwrap());
    assert_eq!(dummy.field("mtu").unwrap(), Some(json!(1400)));

    dummy.remove();
    dummy.commit().unwrap();
    assert!(!dummy.exists().unwrap());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_field_rejected_on_commit() {
    let db = lab_db().await;

    let eth0 = db.interfaces().get("eth0").unwrap();
    eth0.set("warp_factor", 9);
    assert!(matches!(eth0.commit(), Err(Error::UnknownField(_))));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_dump_summary_and_csv() {
    let db = lab_db().await;

    let dump = db.interfaces().dump(None).unwrap();
    assert_eq!(dump.header()[0], "target");
    assert_eq!(dump.len(), 2);

    let summary = db.interfaces().summary(None).unwrap();
    assert_eq!(summary.header(), &["target", "ifname"]);

    let filtered = db
        .interfaces()
        .dump(Some(BTreeMap::from([(
            "ifname".to_string(),
            json!("eth0"),
        )])))
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let csv = db
        .addresses()
        .csv(Some(BTreeMap::from([(
            "address".to_string(),
            json!("10.0.0.1"),
        )])))
        .unwrap();
    assert_eq!(csv[0], "target,tflags,ifindex,address,prefixlen");
    assert_eq!(csv[1], "'localhost',0,2,'10.0.0.1',24");
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_bridge_view_and_scoped_neighbours() {
    let db = lab_db().await;

    let bridges = db.bridges().dump(None).unwrap();
    assert_eq!(bridges.len(), 1);

    // Neighbours scoped to eth0 pull its ifindex into the predicate.
    let eth0 = db.interfaces().get("eth0").unwrap();
    let scoped = db
        .neighbours()
        .scoped(vec![eth0], [("ifindex", "ifindex")]);
    let report = scoped.dump(None).unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(
        report.rows()[0][3],
        json!("10.0.0.2"),
        "only the eth0 neighbour is in scope"
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_wait_satisfied_from_store() {
    let db = lab_db().await;

    // Already mirrored: returns without any new event arriving.
    tokio::time::timeout(
        Duration::from_secs(5),
        db.wait(
            WaitSpec::new()
                .interface("eth0")
                .address("10.0.0.1", 24),
        ),
    )
    .await
    .expect("wait timed out")
    .unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_keeps_or_flushes_rows() {
    let store: Arc<dyn Schema> = Arc::new(SqliteStore::in_memory().unwrap());
    let db = NetDb::new(store, Vec::new(), Config::default()).await.unwrap();

    let keep = Target::new("keep");
    let drop_me = Target::new("drop");
    db.connect_source(
        keep.clone(),
        SourceSpec::handle(Box::new(lab_provider())),
    )
    .await
    .unwrap();
    db.connect_source(
        drop_me.clone(),
        SourceSpec::handle(Box::new(lab_provider())),
    )
    .await
    .unwrap();

    db.disconnect_source(&keep, false).await.unwrap();
    db.disconnect_source(&drop_me, true).await.unwrap();

    let rows = db
        .fetch(
            "SELECT DISTINCT target FROM interfaces ORDER BY target",
            &[],
        )
        .unwrap();
    assert_eq!(rows, vec![vec![Value::String("keep".to_string())]]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_summary_spans_targets() {
    let store: Arc<dyn Schema> = Arc::new(SqliteStore::in_memory().unwrap());
    let db = NetDb::new(store, Vec::new(), Config::default()).await.unwrap();

    db.connect_source(
        Target::localhost(),
        SourceSpec::handle(Box::new(lab_provider())),
    )
    .await
    .unwrap();
    db.connect_source(
        Target::new("remote"),
        SourceSpec::handle(Box::new(lab_provider())),
    )
    .await
    .unwrap();

    let summary = db.interfaces().summary(None).unwrap();
    assert_eq!(summary.len(), 4, "two interfaces per target");
    db.close().await.unwrap();
}
