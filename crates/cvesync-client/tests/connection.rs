#![allow(missing_docs, unused_results)]

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio::time::Instant;

use cvesync_client::LatencyQuality;
use cvesync_core::errors::ConnectionError;
use cvesync_core::protocol::{LifecycleEvent, WireFrame, events};
use cvesync_core::{ConnectionState, Credential};

use common::{connect, next_lifecycle, next_state, settings, settle, start, wait_for_state};

#[tokio::test(start_paused = true)]
async fn connect_without_credential_is_an_auth_error() {
    let (client, server) = start(settings());

    assert_matches!(
        client.connect(None).await,
        Err(ConnectionError::MissingCredential)
    );
    assert_eq!(client.connection_state(), ConnectionState::AuthError);
    assert_eq!(server.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_is_not_retried() {
    let (client, mut server) = start(settings());
    let mut lifecycle = client.on_lifecycle();
    server.fail_next_open("unauthorized (HTTP 401)");

    client.connect(Some(Credential::from("expired"))).await.unwrap();
    wait_for_state(&client, ConnectionState::AuthError).await;
    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        LifecycleEvent::ConnectError {
            reason: "unauthorized (HTTP 401)".into()
        }
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.open_count(), 1);
    assert!(server.try_accept().is_none());
    assert_eq!(client.connection_state(), ConnectionState::AuthError);
}

#[tokio::test(start_paused = true)]
async fn offline_waits_for_connectivity_then_reconnects() {
    let (client, mut server) = start(settings());
    let conn = connect(&client, &mut server).await;
    let mut lifecycle = client.on_lifecycle();

    client.set_online(false);
    wait_for_state(&client, ConnectionState::NetworkError).await;
    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        LifecycleEvent::Disconnect {
            reason: "offline".into()
        }
    );
    assert!(!conn.is_open());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(server.open_count(), 1);

    let restored_at = Instant::now();
    client.set_online(true);
    let _conn = server.accept().await.unwrap();
    let waited = restored_at.elapsed();
    assert!(
        waited >= Duration::from_secs(2) && waited < Duration::from_secs(3),
        "reconnected after {waited:?}"
    );

    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        LifecycleEvent::ReconnectAttempt { attempt: 1 }
    );
    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        LifecycleEvent::Reconnect { attempt: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn pong_updates_latency() {
    let mut config = settings();
    config.connection.latency_interval_ms = 1_000;
    let (client, mut server) = start(config);
    let mut conn = connect(&client, &mut server).await;

    let ping = conn.recv_event(events::PING).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut pong = WireFrame::new(events::PONG, json!({}));
    pong.id = ping.id.clone();
    assert!(conn.send_frame(&pong));
    settle().await;

    let latency = client.latency();
    assert_eq!(latency.average_ms, Some(50));
    assert_eq!(latency.last_ms, Some(50));
    assert_eq!(latency.quality, LatencyQuality::Excellent);
    assert_eq!(latency.timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_probe_counts_as_timeout() {
    let mut config = settings();
    config.connection.latency_interval_ms = 1_000;
    config.connection.ping_timeout_ms = 500;
    let (client, mut server) = start(config);
    let mut conn = connect(&client, &mut server).await;

    conn.recv_event(events::PING).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let latency = client.latency();
    assert_eq!(latency.timeouts, 1);
    assert_eq!(latency.average_ms, None);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn server_ping_is_answered() {
    let (client, mut server) = start(settings());
    let mut conn = connect(&client, &mut server).await;

    assert!(conn.send_frame(&WireFrame::new(events::PING, json!({})).with_id("s1")));
    let pong = conn.recv().await.unwrap();
    assert_eq!(pong.event, events::PONG);
    assert_eq!(pong.id.as_deref(), Some("s1"));
}

#[tokio::test(start_paused = true)]
async fn emit_before_connect_is_flushed_in_snake_case() {
    let (client, mut server) = start(settings());
    client
        .emit("typing", json!({ "cveId": "CVE-1", "isTyping": true }))
        .unwrap();
    assert_eq!(client.metrics().queued_frames, 1);

    let mut conn = connect(&client, &mut server).await;
    let frame = conn.recv().await.unwrap();
    assert_eq!(frame.event, "typing");
    assert_eq!(frame.data, json!({ "cve_id": "CVE-1", "is_typing": true }));
    assert_eq!(client.metrics().queued_frames, 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let mut config = settings();
    config.connection.max_reconnect_attempts = 2;
    let (client, server) = start(config);
    for _ in 0..3 {
        server.fail_next_open("transport error: connection refused");
    }
    let mut lifecycle = client.on_lifecycle();

    client.connect(Some(Credential::from("token"))).await.unwrap();

    let refused = || LifecycleEvent::ConnectError {
        reason: "transport error: connection refused".into(),
    };
    let expected = [
        refused(),
        LifecycleEvent::ReconnectAttempt { attempt: 1 },
        refused(),
        LifecycleEvent::ReconnectAttempt { attempt: 2 },
        refused(),
        LifecycleEvent::ReconnectFailed,
    ];
    for want in expected {
        assert_eq!(next_lifecycle(&mut lifecycle).await, want);
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.open_count(), 3);
    assert_eq!(client.connection_state(), ConnectionState::TransportError);
    assert_eq!(client.metrics().reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_final() {
    let (client, mut server) = start(settings());
    let conn = connect(&client, &mut server).await;
    let mut lifecycle = client.on_lifecycle();

    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        LifecycleEvent::Disconnect {
            reason: "io client disconnect".into()
        }
    );
    assert!(!conn.is_open());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(server.open_count(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn server_ping_timeout_triggers_reconnect() {
    let (client, mut server) = start(settings());
    let conn = connect(&client, &mut server).await;
    let mut states = client.on_state_change();
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    conn.send(events::DISCONNECT, json!({ "reason": "ping timeout" }));
    assert_eq!(next_state(&mut states).await, ConnectionState::PingTimeout);
    assert_eq!(next_state(&mut states).await, ConnectionState::Reconnecting);

    let _conn = server.accept().await.unwrap();
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);
    assert_eq!(server.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_counted_and_skipped() {
    let (client, mut server) = start(settings());
    let conn = connect(&client, &mut server).await;

    assert!(conn.send_raw("not json"));
    settle().await;
    assert_eq!(client.metrics().dropped_frames, 1);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}
