//! # cvesync
//!
//! Headless sync client. Connects to the real-time server, watches the CVE
//! ids given on the command line and logs connection changes, watcher lists
//! and the cache operations domain events would trigger.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;

use cvesync_client::{BusEvent, CacheKey, ResourceCache, SyncClient, Topic};
use cvesync_core::Credential;
use cvesync_core::errors::CacheApplyError;
use cvesync_core::logging::{LogFormat, init_subscriber};
use cvesync_core::protocol::events;
use cvesync_settings::SyncSettings;

/// CVE real-time sync client.
#[derive(Parser, Debug)]
#[command(name = "cvesync", about = "Watch CVE resources over the real-time connection")]
struct Cli {
    /// Server URL (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Bearer token for the connection.
    #[arg(long, env = "CVESYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Settings file (defaults to `~/.cvesync/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Resource ids to watch.
    ids: Vec<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<SyncSettings> {
        let mut settings = match &self.settings {
            Some(path) => cvesync_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => cvesync_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(url) = &self.url {
            settings.server.url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

/// Cache that only reports what it was asked to do.
struct LoggingCache;

impl ResourceCache for LoggingCache {
    fn invalidate(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
        tracing::info!(%key, "invalidate");
        Ok(())
    }

    fn patch(&self, key: &CacheKey, body: &Value) -> Result<(), CacheApplyError> {
        tracing::info!(%key, %body, "patch");
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
        tracing::info!(%key, "evict");
        Ok(())
    }
}

fn log_event(event: &BusEvent) {
    match event {
        BusEvent::StateChanged(change) => {
            tracing::info!(from = %change.previous, to = %change.current, "connection state");
        }
        BusEvent::Lifecycle(lifecycle) => tracing::info!(?lifecycle, "lifecycle"),
        BusEvent::Latency(latency) => {
            tracing::debug!(average_ms = ?latency.average_ms, quality = ?latency.quality, "latency");
        }
        BusEvent::SubscriptionFailed(failure) => tracing::warn!(
            resource_id = %failure.resource_id,
            kind = ?failure.kind,
            error = %failure.error,
            "subscription failed"
        ),
        BusEvent::Message(message) => {
            tracing::info!(event = %message.event, data = %message.data, "message");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;
    init_subscriber(
        &settings.logging.level,
        LogFormat::parse(&settings.logging.format),
    );

    let client = Arc::new(
        SyncClient::builder(settings)
            .cache(Arc::new(LoggingCache))
            .build()
            .context("Invalid settings")?,
    );
    let mut feed = client.bus().subscribe_many([
        Topic::State,
        Topic::Lifecycle,
        Topic::Latency,
        Topic::SubscriptionFailed,
        Topic::message(events::SUBSCRIBERS_UPDATED),
        Topic::message(events::CRAWLER_COMPLETED),
    ]);

    client
        .connect(args.token.map(Credential::from))
        .await
        .context("Failed to connect")?;

    // Subscriptions wait for the connection, so each runs on its own task.
    for id in args.ids {
        let client = Arc::clone(&client);
        let _ = tokio::spawn(async move {
            match client.subscribe(id.as_str()).await {
                Ok(()) => {
                    let watchers: Vec<String> = client
                        .get_subscribers(id.as_str())
                        .into_iter()
                        .map(|s| s.id.into_inner())
                        .collect();
                    tracing::info!(resource_id = %id, ?watchers, "subscribed");
                }
                Err(e) => tracing::warn!(resource_id = %id, error = %e, "subscribe failed"),
            }
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            event = feed.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    tracing::info!("Shutting down...");
    client.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
