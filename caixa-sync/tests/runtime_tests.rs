mod support;

use caixa_sync::types::*;
use caixa_sync::{ApiConfig, NetworkSignal, SyncRuntime};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use support::*;
use wiremock::MockServer;

const WAIT: Duration = Duration::from_secs(3);

async fn live_server() -> MockServer {
    let server = MockServer::start().await;
    mount_health(&server).await;
    mount_sync(&server, 200).await;
    server
}

#[tokio::test]
async fn start_uses_saved_config() {
    let store = memory_store();
    let config = ApiConfig {
        retry_attempts: 7,
        ..config_for(&dead_url())
    };
    config.save(&store).await.unwrap();

    let signal = NetworkSignal::new(false);
    let runtime = SyncRuntime::start(store, signal.subscribe()).await.unwrap();
    assert_eq!(runtime.api().config(), config);
}

#[tokio::test]
async fn start_rejects_invalid_config() {
    let signal = NetworkSignal::new(false);
    let config = ApiConfig {
        timeout_ms: 0,
        ..ApiConfig::default()
    };
    assert!(SyncRuntime::start_with_config(memory_store(), config, signal.subscribe()).is_err());
}

#[tokio::test]
async fn server_coming_up_arms_auto_sync_and_drains() {
    let server = live_server().await;
    let signal = NetworkSignal::new(false);
    let runtime =
        SyncRuntime::start_with_config(memory_store(), config_for(&server.uri()), signal.subscribe())
            .unwrap();

    runtime
        .queue()
        .enqueue(OperationType::Insert, "clientes", json!({ "nome": "Ana" }), None)
        .await
        .unwrap();
    assert!(!runtime.queue().is_auto_syncing());

    signal.set_online(true);
    assert!(eventually(WAIT, || runtime.queue().is_auto_syncing()).await);

    let mut drained = false;
    for _ in 0..150 {
        if runtime.queue().is_empty().await.unwrap() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained);
    runtime.shutdown();
}

#[tokio::test]
async fn losing_network_disarms_auto_sync() {
    let server = live_server().await;
    let signal = NetworkSignal::new(true);
    let runtime =
        SyncRuntime::start_with_config(memory_store(), config_for(&server.uri()), signal.subscribe())
            .unwrap();
    assert!(eventually(WAIT, || runtime.queue().is_auto_syncing()).await);

    signal.set_online(false);
    assert!(eventually(WAIT, || !runtime.queue().is_auto_syncing()).await);
    assert_eq!(runtime.monitor().status(), ConnectionStatus::Offline);
}

#[tokio::test]
async fn unreachable_server_never_arms_auto_sync() {
    let signal = NetworkSignal::new(true);
    let runtime =
        SyncRuntime::start_with_config(memory_store(), config_for(&dead_url()), signal.subscribe())
            .unwrap();

    runtime.monitor().check_now().await;
    assert_eq!(runtime.monitor().status(), ConnectionStatus::ServerUnavailable);
    assert!(!runtime.queue().is_auto_syncing());
}

#[tokio::test]
async fn shutdown_stops_timers() {
    let server = live_server().await;
    let signal = NetworkSignal::new(true);
    let runtime =
        SyncRuntime::start_with_config(memory_store(), config_for(&server.uri()), signal.subscribe())
            .unwrap();
    assert!(eventually(WAIT, || runtime.queue().is_auto_syncing()).await);

    runtime.shutdown();
    assert!(runtime.monitor().is_shut_down());
    assert!(!runtime.queue().is_auto_syncing());
}

#[tokio::test]
async fn update_config_persists_and_applies() {
    let store = memory_store();
    let signal = NetworkSignal::new(false);
    let runtime =
        SyncRuntime::start_with_config(store.clone(), config_for(&dead_url()), signal.subscribe())
            .unwrap();

    let fallback = live_server().await;
    let updated = ApiConfig {
        fallback_url: Some(fallback.uri()),
        ..runtime.api().config()
    };
    runtime.update_config(updated.clone()).await.unwrap();

    assert_eq!(runtime.api().config(), updated);
    assert_eq!(ApiConfig::load(&store).await.unwrap(), updated);
}
