//! Cross-process propagation through each watch strategy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use serial_test::serial;
use waffle_config::{
    ConfigStore, FileStore, LocalBus, MemoryStore, PgStore, SchemaRegistry, SyncBackend,
    WaffleState,
};
use waffle_test_support::fixtures::{schema_document, unique_channel};
use waffle_test_support::postgres::start_postgres;

const DEADLINE: Duration = Duration::from_secs(5);

fn registry() -> anyhow::Result<SchemaRegistry> {
    Ok(SchemaRegistry::from_value(&schema_document())?)
}

async fn wait_for(state: &WaffleState, key: &str, expected: &Value) -> anyhow::Result<()> {
    tokio::time::timeout(DEADLINE, async {
        while state.get(key).await.as_ref() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

fn set(key: &str, value: Value) -> BTreeMap<String, Value> {
    BTreeMap::from([(key.to_string(), value)])
}

async fn start_pair(
    first: impl ConfigStore + 'static,
    second: impl ConfigStore + 'static,
    backend: SyncBackend,
) -> anyhow::Result<(WaffleState, WaffleState)> {
    let writer = WaffleState::builder(registry()?, first)
        .sync(backend.clone())
        .start()
        .await?;
    let reader = WaffleState::builder(registry()?, second)
        .sync(backend)
        .start()
        .await?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    Ok((writer, reader))
}

#[tokio::test]
async fn file_strategy_propagates_within_poll_interval() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("store.json");
    let backend = SyncBackend::File {
        path: dir.path().join("sentinel.txt"),
        interval: Duration::from_millis(50),
    };
    let (writer, reader) =
        start_pair(FileStore::new(&store_path), FileStore::new(&store_path), backend).await?;
    assert!(dir.path().join("sentinel.txt").exists());

    writer.update_db(set("MAX_USERS", json!(25))).await?;
    wait_for(&reader, "MAX_USERS", &json!(25)).await?;

    writer.shutdown().await;
    reader.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn local_bus_propagates_immediately() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let bus = LocalBus::new();
    let (writer, reader) =
        start_pair(store.clone(), store.clone(), SyncBackend::Local(bus.clone())).await?;
    assert_eq!(bus.watcher_count(), 2);

    writer.update_db(set("SITE_NAME", json!("Pancake"))).await?;
    wait_for(&reader, "SITE_NAME", &json!("Pancake")).await?;

    reader.update_db(set("MAINTENANCE", json!(true))).await?;
    wait_for(&writer, "MAINTENANCE", &json!(true)).await?;
    Ok(())
}

#[tokio::test]
async fn snapshot_subscribers_see_remote_changes() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (writer, reader) =
        start_pair(store.clone(), store, SyncBackend::Local(LocalBus::new())).await?;
    let mut snapshots = reader.subscribe();

    writer.update_db(set("RATIO", json!(0.9))).await?;
    tokio::time::timeout(DEADLINE, async {
        loop {
            if snapshots.borrow_and_update().get("RATIO") == Some(&json!(0.9)) {
                break;
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;
    assert_eq!(reader.get("RATIO").await, Some(json!(0.9)));
    Ok(())
}

#[tokio::test]
async fn dropping_state_stops_its_watcher() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let state = WaffleState::builder(registry()?, MemoryStore::new())
        .sync(SyncBackend::Local(bus.clone()))
        .start()
        .await?;
    assert_eq!(bus.watcher_count(), 1);
    drop(state);
    tokio::time::timeout(DEADLINE, async {
        while bus.watcher_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn postgres_strategy_propagates_through_listen_notify() -> anyhow::Result<()> {
    let Ok(database) = start_postgres() else {
        eprintln!("skipping: no test database configured");
        return Ok(());
    };
    let first = PgStore::connect(database.connection_string()).await?;
    let second = PgStore::connect(database.connection_string()).await?;
    let backend = SyncBackend::Postgres {
        pool: first.pool().clone(),
        channel: unique_channel("waffle"),
    };
    let (writer, reader) = start_pair(first, second, backend).await?;
    // LISTEN is attached asynchronously by the watcher task.
    tokio::time::sleep(Duration::from_millis(200)).await;

    writer.update_db(set("MAX_USERS", json!(40))).await?;
    wait_for(&reader, "MAX_USERS", &json!(40)).await?;

    writer.shutdown().await;
    reader.shutdown().await;
    Ok(())
}

#[cfg(feature = "redis")]
#[tokio::test]
#[serial]
async fn redis_strategy_propagates_through_pubsub() -> anyhow::Result<()> {
    let Some((host, port)) = waffle_test_support::fixtures::redis_endpoint() else {
        eprintln!("skipping: no test redis configured");
        return Ok(());
    };
    let store = MemoryStore::new();
    let backend = SyncBackend::Redis {
        host,
        port,
        channel: unique_channel("waffle"),
    };
    let (writer, reader) = start_pair(store.clone(), store, backend).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    writer.update_db(set("SITE_NAME", json!("Crepe"))).await?;
    wait_for(&reader, "SITE_NAME", &json!("Crepe")).await?;

    writer.shutdown().await;
    reader.shutdown().await;
    Ok(())
}
