use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hauler::adapters::SimulatedConnectivity;
use hauler::config::AppConfig;
use hauler::context::AppContext;
use hauler::core::{
    Connectivity, NetworkClass, ObjectMetadata, RecordUpdate, StatusUpdater, TransferRecord,
    TransferState,
};
use hauler::db::{self, RecordStore, SqliteRecordStore};
use hauler::store::MemoryStore;

async fn open(path: &std::path::Path) -> Arc<SqliteRecordStore> {
    Arc::new(SqliteRecordStore::new(db::init(path).await.unwrap()))
}

#[tokio::test]
async fn record_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/hauler.db");

    let mut record = TransferRecord::download(
        "photos",
        "2024/a.jpg",
        "/data/a.jpg",
        Some(10..110),
        NetworkClass::UnmeteredOnly,
    );
    record.metadata = ObjectMetadata {
        content_type: Some("image/jpeg".into()),
        user_metadata: BTreeMap::from([("camera".to_string(), "x100".to_string())]),
        ..Default::default()
    };

    let id = {
        let store = open(&path).await;
        let id = store.insert(&record).await.unwrap();
        store
            .update_fields(
                id,
                &RecordUpdate {
                    state: Some(TransferState::InProgress),
                    bytes_current: Some(40),
                    retry_count: Some(2),
                    etag: Some("abc".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        id
    };

    let store = open(&path).await;
    let loaded = store.get(id).await.unwrap().unwrap();
    assert_eq!(loaded.id, id);
    assert_eq!(loaded.state, TransferState::InProgress);
    assert_eq!(loaded.bucket, "photos");
    assert_eq!(loaded.key, "2024/a.jpg");
    assert_eq!(loaded.range_start, 10);
    assert_eq!(loaded.range_end, Some(110));
    assert_eq!(loaded.bytes_total, 100);
    assert_eq!(loaded.bytes_current, 40);
    assert_eq!(loaded.retry_count, 2);
    assert_eq!(loaded.etag.as_deref(), Some("abc"));
    assert_eq!(loaded.network, NetworkClass::UnmeteredOnly);
    assert_eq!(loaded.metadata, record.metadata);

    let history = store.history(id).await.unwrap();
    let states: Vec<_> = history.iter().map(|h| h.state.as_str()).collect();
    assert_eq!(states, vec!["WAITING", "IN_PROGRESS"]);
}

#[tokio::test]
async fn reload_keeps_progress_and_normalizes_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hauler.db");
    let store = open(&path).await;

    let mut running = TransferRecord::upload("b", "running", "/data/r", 1000, NetworkClass::Any);
    running.state = TransferState::InProgress;
    running.bytes_current = 600;
    let running_id = store.insert(&running).await.unwrap();

    let mut pausing = TransferRecord::upload("b", "pausing", "/data/p", 1000, NetworkClass::Any);
    pausing.state = TransferState::PendingPause;
    let pausing_id = store.insert(&pausing).await.unwrap();

    let mut done = TransferRecord::upload("b", "done", "/data/d", 10, NetworkClass::Any);
    done.state = TransferState::Completed;
    store.insert(&done).await.unwrap();

    let updater = StatusUpdater::new(open(&path).await, 1);
    let loaded = updater.load_non_terminal().await.unwrap();
    assert_eq!(loaded.len(), 2);

    let reloaded = loaded.iter().find(|r| r.id == running_id).unwrap();
    assert_eq!(reloaded.state, TransferState::Waiting);
    assert_eq!(reloaded.bytes_current, 600);
    assert_eq!(reloaded.bytes_total, 1000);

    let paused = loaded.iter().find(|r| r.id == pausing_id).unwrap();
    assert_eq!(paused.state, TransferState::Paused);

    let persisted = store.get(running_id).await.unwrap().unwrap();
    assert_eq!(persisted.state, TransferState::Waiting);
}

#[tokio::test]
async fn recovery_without_network_parks_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hauler.db");
    let store = open(&path).await;

    let file = dir.path().join("k");
    let mut record = TransferRecord::upload("b", "k", file, 1000, NetworkClass::Any);
    record.state = TransferState::InProgress;
    record.bytes_current = 500;
    let id = store.insert(&record).await.unwrap();

    let (source, _controller) = SimulatedConnectivity::new(Connectivity::OFFLINE);
    let ctx = AppContext::with_parts(
        AppConfig::default(),
        store.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(source),
    );

    let recovered = ctx.coordinator.recover_pending_on_startup().await.unwrap();
    assert_eq!(recovered, vec![id]);

    let observer = ctx.coordinator.observer(id).await.unwrap();
    assert_eq!(observer.state(), TransferState::WaitingForNetwork);
    assert_eq!(observer.bytes_transferred(), 500);
    assert_eq!(observer.bytes_total(), 1000);

    ctx.shutdown(Duration::from_secs(1)).await;
    let history = store.history(id).await.unwrap();
    let states: Vec<_> = history.iter().map(|h| h.state.as_str()).collect();
    assert_eq!(states, vec!["IN_PROGRESS", "WAITING", "WAITING_FOR_NETWORK"]);
}
