mod support;

use caixa_sync::types::*;
use caixa_sync::{ApiConfig, ConnectionMonitor, Connectivity, NetworkSignal};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOUR: Duration = Duration::from_secs(3600);
const WAIT: Duration = Duration::from_secs(3);

fn monitor_for(config: ApiConfig, signal: &NetworkSignal, every: Duration) -> ConnectionMonitor {
    let store = memory_store();
    ConnectionMonitor::start(client(&store, config), signal.subscribe(), every)
}

async fn health_hits(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|req| req.url.path() == "/api/health")
        .count()
}

// --- Probing ---

#[tokio::test]
async fn first_probe_marks_server_available() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);

    assert!(eventually(WAIT, || monitor.is_api_available()).await);
    let state = monitor.state();
    assert!(state.is_online);
    assert!(state.api_latency.is_some());
    assert!(state.last_check.is_some());
    assert_eq!(state.current_url, server.uri());
    assert!(!state.is_using_fallback);
    assert_eq!(monitor.status(), ConnectionStatus::Online);
}

#[tokio::test]
async fn unreachable_server_is_unavailable_not_offline() {
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&dead_url()), &signal, HOUR);

    assert!(eventually(WAIT, || monitor.state().last_check.is_some()).await);
    let state = monitor.state();
    assert!(state.is_online);
    assert!(!state.is_api_available);
    assert!(state.api_latency.is_none());
    assert_eq!(monitor.status(), ConnectionStatus::ServerUnavailable);
}

#[tokio::test]
async fn failing_health_endpoint_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);

    let state = monitor.check_now().await;
    assert!(!state.is_api_available);
    assert!(state.last_check.is_some());
}

#[tokio::test]
async fn probe_reports_fallback_usage() {
    let fallback = MockServer::start().await;
    mount_health(&fallback).await;
    let config = ApiConfig {
        fallback_url: Some(fallback.uri()),
        ..config_for(&dead_url())
    };
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config, &signal, HOUR);

    let state = monitor.check_now().await;
    assert!(state.is_api_available);
    assert!(state.is_using_fallback);
    assert_eq!(state.current_url, fallback.uri());
}

#[tokio::test]
async fn periodic_probes_keep_running() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let _monitor = monitor_for(config_for(&server.uri()), &signal, Duration::from_millis(30));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(health_hits(&server).await >= 3);
}

#[tokio::test]
async fn last_check_never_moves_backwards() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, Duration::from_millis(5));

    let mut previous = None;
    for _ in 0..10 {
        let state = monitor.check_now().await;
        assert!(state.last_check >= previous);
        previous = state.last_check;
    }
}

// --- Network signal ---

#[tokio::test]
async fn going_offline_is_immediate_and_stops_probing() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, Duration::from_millis(20));
    assert!(eventually(WAIT, || monitor.is_api_available()).await);

    signal.set_online(false);
    assert!(eventually(WAIT, || !monitor.state().is_online).await);
    let state = monitor.state();
    assert!(!state.is_api_available);
    assert!(state.api_latency.is_none());
    assert_eq!(monitor.status(), ConnectionStatus::Offline);

    // Let any probe already on the wire land, then expect silence.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let hits = health_hits(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(health_hits(&server).await, hits);
    assert!(!monitor.is_api_available());
}

#[tokio::test]
async fn starting_offline_never_probes() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(false);
    let monitor = monitor_for(config_for(&server.uri()), &signal, Duration::from_millis(20));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(health_hits(&server).await, 0);
    assert_eq!(monitor.status(), ConnectionStatus::Offline);

    let state = monitor.check_now().await;
    assert!(!state.is_api_available);
    assert_eq!(health_hits(&server).await, 0);
}

#[tokio::test]
async fn coming_back_online_probes_right_away() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(false);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);
    assert!(!monitor.is_api_available());

    signal.set_online(true);
    assert!(eventually(WAIT, || monitor.is_api_available()).await);
    assert!(health_hits(&server).await >= 1);
}

#[tokio::test]
async fn closed_signal_keeps_last_value() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);
    drop(signal);

    assert!(eventually(WAIT, || monitor.is_api_available()).await);
    assert!(monitor.check_now().await.is_online);
}

// --- Subscribers ---

#[tokio::test]
async fn subscriber_gets_current_state_then_updates() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(false);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = monitor.subscribe(move |state| sink.lock().unwrap().push(state.status()));
    assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Offline]);

    signal.set_online(true);
    assert!(eventually(WAIT, || monitor.is_api_available()).await);
    assert_eq!(seen.lock().unwrap().last(), Some(&ConnectionStatus::Online));

    sub.unsubscribe();
    let count = seen.lock().unwrap().len();
    signal.set_online(false);
    assert!(eventually(WAIT, || !monitor.state().is_online).await);
    assert_eq!(seen.lock().unwrap().len(), count);
}

// --- Teardown ---

#[tokio::test]
async fn probe_in_flight_does_not_update_after_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);

    assert!(eventually(WAIT, || monitor.state().is_checking).await);
    monitor.shutdown();
    assert!(monitor.is_shut_down());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let state = monitor.state();
    assert!(state.last_check.is_none());
    assert!(!state.is_api_available);
}

#[tokio::test]
async fn shutdown_ignores_network_changes() {
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&dead_url()), &signal, HOUR);
    monitor.shutdown();

    signal.set_online(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(monitor.state().is_online);
}

// --- Connectivity hook ---

#[tokio::test]
async fn unreachable_report_triggers_probe() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    let signal = NetworkSignal::new(true);
    let monitor = monitor_for(config_for(&server.uri()), &signal, HOUR);
    assert!(eventually(WAIT, || monitor.is_api_available()).await);
    let before = health_hits(&server).await;

    monitor.on_server_unreachable();
    let mut probed = false;
    for _ in 0..100 {
        if health_hits(&server).await > before {
            probed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(probed);
}
