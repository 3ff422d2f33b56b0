#![allow(dead_code, missing_docs, unused_results)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use cvesync_client::{BusEvent, BusSubscription, MemoryServer, MemoryTransport, ServerConnection, SyncClient};
use cvesync_core::protocol::{LifecycleEvent, WireFrame, events};
use cvesync_core::{ConnectionState, Credential};
use cvesync_settings::SyncSettings;

/// Defaults with a local user and probes pushed out of the way.
pub fn settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.server.user_id = Some("u1".into());
    settings.server.display_name = "Analyst".into();
    settings.connection.latency_interval_ms = 3_600_000;
    settings
}

pub fn start(settings: SyncSettings) -> (SyncClient, MemoryServer) {
    let (transport, server) = MemoryTransport::pair();
    let client = SyncClient::builder(settings)
        .transport(Arc::new(transport))
        .build()
        .unwrap();
    (client, server)
}

pub async fn connect(client: &SyncClient, server: &mut MemoryServer) -> ServerConnection {
    client.connect(Some(Credential::from("token"))).await.unwrap();
    let conn = server.accept().await.unwrap();
    wait_for_state(client, ConnectionState::Connected).await;
    conn
}

pub async fn wait_for_state(client: &SyncClient, want: ConnectionState) {
    let mut states = client.on_state_change();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match states.recv().await {
                Some(BusEvent::StateChanged(change)) if change.current == want => return,
                Some(_) => {}
                None => panic!("bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want}"));
}

pub async fn next_state(states: &mut BusSubscription) -> ConnectionState {
    match states.recv().await {
        Some(BusEvent::StateChanged(change)) => change.current,
        other => panic!("expected a state change, got {other:?}"),
    }
}

pub async fn next_lifecycle(lifecycle: &mut BusSubscription) -> LifecycleEvent {
    match lifecycle.recv().await {
        Some(BusEvent::Lifecycle(event)) => event,
        other => panic!("expected a lifecycle event, got {other:?}"),
    }
}

/// Answer the next request frame with a successful acknowledgement.
pub async fn ack_next(conn: &mut ServerConnection, subscribers: &[&str]) -> WireFrame {
    let frame = conn.recv().await.expect("request frame");
    let status = if frame.event == events::SUBSCRIBE {
        "subscribed"
    } else {
        "unsubscribed"
    };
    let subscribers: Vec<Value> = subscribers
        .iter()
        .map(|id| json!({ "id": id, "display_name": format!("user {id}") }))
        .collect();
    conn.send(
        events::SUBSCRIPTION_STATUS,
        json!({
            "resource_id": frame.data["resourceId"],
            "success": true,
            "status": status,
            "subscribers": subscribers,
            "correlation_id": frame.data["correlationId"],
        }),
    );
    frame
}

/// Let spawned tasks run without moving the clock much.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
