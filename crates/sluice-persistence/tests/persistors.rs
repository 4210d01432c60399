//! Persistor backends against real stores.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sluice_core::{Action, PersistenceConfig, Persistor, Store};
use sluice_persistence::{JsonFilePersistor, MemoryPersistor};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Counter {
    count: u32,
    label: String,
}

// =============================================================================
// JsonFilePersistor
// =============================================================================

#[tokio::test]
async fn missing_file_reads_as_nothing_saved() {
    let dir = tempfile::tempdir().unwrap();
    let persistor = JsonFilePersistor::new(dir.path().join("state"));
    assert_eq!(persistor.get("counter").await.unwrap(), None);
}

#[tokio::test]
async fn set_then_get_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let persistor = JsonFilePersistor::new(dir.path());

    persistor
        .set("counter", json!({ "count": 3, "label": "taps" }))
        .await
        .unwrap();
    persistor
        .set("counter", json!({ "count": 4, "label": "taps" }))
        .await
        .unwrap();

    // A second instance over the same directory sees the latest write.
    let reopened = JsonFilePersistor::new(dir.path());
    assert_eq!(
        reopened.get("counter").await.unwrap(),
        Some(json!({ "count": 4, "label": "taps" }))
    );
    assert!(!dir.path().join("counter.json.tmp").exists());
}

#[tokio::test]
async fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("counter.json"), b"{ not json")
        .await
        .unwrap();

    let persistor = JsonFilePersistor::new(dir.path());
    let err = persistor.get("counter").await.unwrap_err();
    assert!(err.to_string().contains("corrupt state file"));
}

#[tokio::test]
async fn store_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        PersistenceConfig::new(
            "counter",
            Arc::new(JsonFilePersistor::new(dir.path())) as Arc<dyn Persistor>,
        )
        .with_save_delay(Duration::from_millis(10))
    };

    let store = Store::persisted(Counter::default(), config());
    store.wait_initialized().await;
    store
        .dispatch(Action::map(|counter: Counter| Counter {
            count: counter.count + 5,
            label: "taps".into(),
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(store);

    let restarted = Store::persisted(Counter::default(), config());
    restarted.wait_initialized().await;
    assert_eq!(
        restarted.get_state(),
        Counter {
            count: 5,
            label: "taps".into()
        }
    );
}

// =============================================================================
// MemoryPersistor
// =============================================================================

#[tokio::test]
async fn seeded_memory_persistor_restores_into_store() {
    let persistor = Arc::new(MemoryPersistor::with_entries([(
        "counter".to_string(),
        json!({ "count": 9 }),
    )]));

    let store = Store::persisted(
        Counter {
            count: 0,
            label: "default".into(),
        },
        PersistenceConfig::new("counter", persistor.clone() as Arc<dyn Persistor>),
    );
    store.wait_initialized().await;

    assert_eq!(
        store.get_state(),
        Counter {
            count: 9,
            label: "default".into()
        }
    );
    assert_eq!(persistor.snapshot().await.len(), 1);
}
