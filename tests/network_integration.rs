//! Exercises `NetworkScanner` against real HTTP and WebSocket servers bound on loopback
//! addresses. Every `127.0.0.x` address routes to the loopback interface on Linux, which lets a
//! single machine stand in for a small LAN range.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;

use laika_link::config::types::ScannerConfig;
use laika_link::error::{ConnectionError, DiscoveryError};
use laika_link::network::scanner::NetworkScanner;
use laika_link::network::session::Session;
use laika_link::network::types::{ConnectionState, DeviceType, DiscoveredDevice, HealthInfo, ScannerEvent};

#[derive(Clone, Default)]
struct Counters {
    accepted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

struct DeviceServer {
    addr: SocketAddr,
    counters: Counters,
}

async fn handle_socket(mut socket: WebSocket, counters: Counters) {
    counters.accepted.fetch_add(1, Ordering::SeqCst);
    counters.live.fetch_add(1, Ordering::SeqCst);

    let _ = socket.send(Message::Text("not json".to_string())).await;
    let _ = socket.send(Message::Text(r#"{"hello":"world"}"#.to_string())).await;

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                if text.contains(r#""command":"bye""#) {
                    break;
                }
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {},
        }
    }

    counters.live.fetch_sub(1, Ordering::SeqCst);
}

async fn spawn_device(ip: &str, name: &'static str, health_delay: Duration) -> DeviceServer {
    let counters = Counters::default();
    let ws_counters = counters.clone();

    let app = Router::new()
        .route("/health", get(move || async move {
            sleep(health_delay).await;
            Json(json!({
                "name": name,
                "version": "1.0.0",
                "capabilities": ["camera", "voice"],
                "status": "ok",
            }))
        }))
        .route("/ws", get(move |ws: WebSocketUpgrade| {
            let counters = ws_counters.clone();
            async move { ws.on_upgrade(move |socket| handle_socket(socket, counters)) }
        }));

    let listener = TcpListener::bind((ip, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    DeviceServer { addr, counters }
}

/// Serves `body` with `status` on `/health` and counts the requests.
async fn spawn_health_host(ip: &str, status: StatusCode, body: Value) -> (u16, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let app = Router::new().route("/health", get(move || {
        let hits = handler_hits.clone();
        let body = body.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (status, Json(body))
        }
    }));

    let listener = TcpListener::bind((ip, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (port, hits)
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

fn loopback_config(priority_hosts: Vec<u8>, ports: Vec<u16>) -> ScannerConfig {
    ScannerConfig {
        network_prefixes: vec!["127.0.0".to_string()],
        priority_hosts,
        mdns_hosts: vec![],
        ports,
        probe_timeout_ms: 1000,
        websocket_probe_timeout_ms: 1000,
        connect_timeout_ms: 2000,
        batch_size: 20,
        batch_delay_ms: 1,
        ..ScannerConfig::default()
    }
}

fn device_for(server: &DeviceServer) -> DiscoveredDevice {
    let mut device = DiscoveredDevice::new("127.0.0.1", server.addr.port(), HealthInfo::default(), DeviceType::KnownDevice);
    device.websocket_url = Some(format!("ws://127.0.0.1:{}/ws", server.addr.port()));
    device
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..150 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn next_message(receiver: &mut Receiver<ScannerEvent>) -> Value {
    loop {
        let event = timeout(Duration::from_secs(5), receiver.next()).await
            .expect("timed out waiting for a message")
            .expect("event channel closed");

        if let ScannerEvent::Message(value) = event {
            return value;
        }
    }
}

fn drain(receiver: &mut Receiver<ScannerEvent>) -> Vec<ScannerEvent> {
    let mut events = vec![];
    while let Ok(Some(event)) = receiver.try_next() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn scan_finds_and_classifies_a_known_device() {
    let server = spawn_device("127.0.0.1", "LAIKA Companion", Duration::ZERO).await;
    let (sender, mut receiver) = channel(64);
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![sender]).unwrap();

    let devices = scanner.start_scan().await.unwrap();

    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.address, "127.0.0.1");
    assert_eq!(device.port, server.addr.port());
    assert_eq!(device.name, "LAIKA Companion");
    assert_eq!(device.device_type, DeviceType::KnownDevice);
    assert_eq!(device.capabilities, vec!["camera".to_string(), "voice".to_string()]);
    assert_eq!(device.version.as_deref(), Some("1.0.0"));
    assert_eq!(device.websocket_url, Some(format!("ws://127.0.0.1:{}/ws", server.addr.port())));

    assert_eq!(scanner.get_best_device().map(|best| best.address), Some("127.0.0.1".to_string()));
    assert!(!scanner.is_scanning());

    let events = drain(&mut receiver);
    assert_eq!(events.first(), Some(&ScannerEvent::ScanStarted));
    assert!(matches!(events.get(1), Some(ScannerEvent::DeviceFound(_))));
    assert_eq!(events.last(), Some(&ScannerEvent::ScanFinished(1)));
}

#[tokio::test]
async fn scan_never_reports_the_same_address_and_port_twice() {
    let server = spawn_device("127.0.0.1", "robot", Duration::ZERO).await;
    let port = server.addr.port();
    let scanner = NetworkScanner::new(loopback_config(vec![1, 1], vec![port, port]), vec![]).unwrap();

    let devices = scanner.start_scan().await.unwrap();

    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn broad_scan_is_skipped_when_priority_hosts_find_a_device() {
    let primary = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let secondary = spawn_device("127.0.0.3", "printer", Duration::ZERO).await;
    let ports = vec![primary.addr.port(), secondary.addr.port()];

    let scanner = NetworkScanner::new(loopback_config(vec![1], ports), vec![]).unwrap();
    let devices = scanner.start_scan().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, "127.0.0.1");
}

#[tokio::test]
async fn broad_scan_runs_when_priority_hosts_find_nothing() {
    let primary = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let secondary = spawn_device("127.0.0.3", "printer", Duration::ZERO).await;
    let ports = vec![primary.addr.port(), secondary.addr.port()];

    let scanner = NetworkScanner::new(loopback_config(vec![2], ports), vec![]).unwrap();
    let devices = scanner.start_scan().await.unwrap();

    assert_eq!(devices.len(), 2);
    let secondary_device = devices.iter().find(|device| device.address == "127.0.0.3").unwrap();
    assert_eq!(secondary_device.device_type, DeviceType::Generic);
    assert_eq!(scanner.get_best_device().unwrap().address, "127.0.0.1");
}

#[tokio::test]
async fn broad_scan_probes_in_delayed_batches_and_skips_priority_hosts() {
    let (priority_port, priority_hits) = spawn_health_host("127.0.0.1", StatusCode::NOT_FOUND, json!({})).await;
    let (broad_port, broad_hits) = spawn_health_host("127.0.0.3", StatusCode::NOT_FOUND, json!({})).await;

    let delay = Duration::from_millis(5);
    let config = ScannerConfig {
        health_paths: vec!["/health".to_string()],
        batch_size: 2,
        batch_delay_ms: delay.as_millis() as u64,
        ..loopback_config(vec![1], vec![priority_port, broad_port])
    };
    let scanner = NetworkScanner::new(config, vec![]).unwrap();

    let started = Instant::now();
    let devices = scanner.start_scan().await.unwrap();
    let elapsed = started.elapsed();

    assert!(devices.is_empty());

    // 253 non-priority hosts in batches of 2 is 127 batches, with a delay between each pair
    let batches = 253_u32.div_ceil(2);
    assert!(elapsed >= delay * (batches - 1), "broad scan took only {:?}", elapsed);

    assert_eq!(priority_hits.load(Ordering::SeqCst), 1);
    assert_eq!(broad_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_body_with_odd_field_types_still_classifies_by_name() {
    let body = json!({"name": "LAIKA Companion", "version": 2, "capabilities": ["camera", 5]});
    let (port, _) = spawn_health_host("127.0.0.1", StatusCode::OK, body).await;
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![port]), vec![]).unwrap();

    let devices = scanner.start_scan().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "LAIKA Companion");
    assert_eq!(devices[0].device_type, DeviceType::KnownDevice);
    assert_eq!(devices[0].version.as_deref(), Some("2"));
    assert_eq!(devices[0].capabilities, vec!["camera".to_string()]);
}

#[tokio::test]
async fn second_scan_while_scanning_is_rejected() {
    let server = spawn_device("127.0.0.1", "LAIKA", Duration::from_millis(400)).await;
    let scanner = Arc::new(NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![]).unwrap());

    let first = tokio::spawn({
        let scanner = scanner.clone();
        async move { scanner.start_scan().await }
    });
    assert!(eventually(|| scanner.is_scanning()).await);

    assert!(matches!(scanner.start_scan().await, Err(DiscoveryError::ScanInProgress)));

    let devices = first.await.unwrap().unwrap();
    assert_eq!(devices.len(), 1);
    assert!(!scanner.is_scanning());
}

#[tokio::test]
async fn connecting_twice_leaves_one_open_socket() {
    let server = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![]).unwrap();
    let device = device_for(&server);

    scanner.connect_to_device(&device).await.unwrap();
    assert!(eventually(|| server.counters.live.load(Ordering::SeqCst) == 1).await);

    scanner.connect_to_device(&device).await.unwrap();
    assert!(eventually(|| server.counters.accepted.load(Ordering::SeqCst) == 2).await);
    assert!(eventually(|| server.counters.live.load(Ordering::SeqCst) == 1).await);
    assert_eq!(scanner.connection_state(), ConnectionState::Connected);

    scanner.disconnect().await;
    assert!(eventually(|| server.counters.live.load(Ordering::SeqCst) == 0).await);
    assert_eq!(scanner.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn inbound_json_is_republished_and_commands_are_sent() {
    let server = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let (sender, mut receiver) = channel(64);
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![sender]).unwrap();

    scanner.connect_to_device(&device_for(&server)).await.unwrap();

    // the malformed frame sent first is dropped
    assert_eq!(next_message(&mut receiver).await, json!({"hello": "world"}));

    scanner.send_command("walk", &json!({"speed": 2})).unwrap();

    let echoed = next_message(&mut receiver).await;
    assert_eq!(echoed["command"], "walk");
    assert_eq!(echoed["data"], json!({"speed": 2}));
    assert!(echoed["timestamp"].as_u64().unwrap() > 0);

    scanner.disconnect().await;
}

#[tokio::test]
async fn device_closing_the_socket_clears_the_session() {
    let server = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let (sender, mut receiver) = channel(64);
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![sender]).unwrap();

    scanner.connect_to_device(&device_for(&server)).await.unwrap();
    scanner.send_command("bye", &json!(null)).unwrap();

    let disconnected = timeout(Duration::from_secs(5), async {
        while let Some(event) = receiver.next().await {
            if event == ScannerEvent::Disconnected {
                return true;
            }
        }
        false
    }).await.unwrap();

    assert!(disconnected);
    assert_eq!(scanner.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(scanner.send_command("wave", &json!({})), Err(ConnectionError::NotConnected)));
}

#[tokio::test]
async fn connect_to_unreachable_device_fails() {
    let port = closed_port().await;
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![port]), vec![]).unwrap();

    let mut device = DiscoveredDevice::new("127.0.0.1", port, HealthInfo::default(), DeviceType::Generic);
    device.websocket_url = Some(format!("ws://127.0.0.1:{}/ws", port));

    let result = scanner.connect_to_device(&device).await;
    assert!(matches!(result, Err(ConnectionError::WebSocket { .. })));
    assert_eq!(scanner.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn auto_connect_without_devices_fails() {
    let port = closed_port().await;
    let scanner = NetworkScanner::new(loopback_config(vec![2], vec![port]), vec![]).unwrap();

    let result = scanner.auto_connect().await;
    assert!(matches!(result, Err(DiscoveryError::NoDevicesFound)));
}

#[tokio::test]
async fn auto_connect_picks_the_known_device() {
    let server = spawn_device("127.0.0.1", "LAIKA Companion", Duration::ZERO).await;
    let scanner = NetworkScanner::new(loopback_config(vec![1], vec![server.addr.port()]), vec![]).unwrap();

    let device = scanner.auto_connect().await.unwrap();

    assert_eq!(device.device_type, DeviceType::KnownDevice);
    assert_eq!(scanner.connection_state(), ConnectionState::Connected);
    scanner.disconnect().await;
}

#[tokio::test]
async fn device_closing_the_socket_stops_both_session_tasks() {
    let server = spawn_device("127.0.0.1", "LAIKA", Duration::ZERO).await;
    let url = format!("ws://127.0.0.1:{}/ws", server.addr.port());
    let session = Session::open(&url, Duration::from_secs(2), vec![]).await.unwrap();

    session.send_text(r#"{"command":"bye"}"#.to_string()).unwrap();

    assert!(eventually(|| session.is_finished()).await);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.close().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn close_gives_up_on_a_peer_that_stops_reading() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _socket = accept_async(stream).await.unwrap();
        // hold the socket open without ever reading from it
        sleep(Duration::from_secs(30)).await;
    });

    let close_timeout = Duration::from_millis(300);
    let session = Session::open(&format!("ws://127.0.0.1:{}", port), close_timeout, vec![]).await.unwrap();

    // far more than the loopback socket buffers hold, so the writer blocks mid-send
    let chunk = "x".repeat(1024 * 1024);
    for _ in 0..32 {
        session.send_text(chunk.clone()).unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    let closed = timeout(Duration::from_secs(5), session.close()).await;
    assert_eq!(closed.ok(), Some(ConnectionState::Connected));
    assert!(eventually(|| session.is_finished()).await);
}
