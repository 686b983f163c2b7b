//! # OPC UA Driver Engine
//!
//! The OPC UA device driver engine: per-device connection lifecycle,
//! read/write/subscribe dispatch, monitored-item fan-out, value coercion,
//! recursive address-space browsing, and change batching.
//!
//! ## Responsibilities
//!
//! 1. Maintain OPC UA sessions and subscriptions per configured device
//! 2. Dispatch read/write/browse/status/restart requests from the supervisor
//! 3. Fan out monitored items across tags that share a node-id
//! 4. Batch value-change notifications for the supervisor
//! 5. Expose health/metrics endpoints for monitoring
//!
//! ## NOT Responsible For
//!
//! - Persistent configuration file I/O (managed by the host)
//! - The supervisor wire framing and command dispatch table
//! - The host-service wrapper
//! - Generic CRUD over nodes/devices/tags lists

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opcua_driver_engine::batching::Batcher;
use opcua_driver_engine::browser::Browser;
use opcua_driver_engine::client::OpcUaTransport;
use opcua_driver_engine::config::Config;
use opcua_driver_engine::config_view::InMemoryConfigView;
use opcua_driver_engine::connection::ConnectionManager;
use opcua_driver_engine::health::{HealthRegistry, HealthServer};
use opcua_driver_engine::metrics::MetricsServer;
use opcua_driver_engine::request_engine::RequestEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opcua_driver_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        "Starting OPC UA driver engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(Config::from_env()?);
    info!(environment = %config.environment, "loaded configuration");

    let transport = Arc::new(OpcUaTransport::new());
    let config_view = Arc::new(InMemoryConfigView::new());
    let health_registry = HealthRegistry::new();
    let browser = Arc::new(Browser::new());
    let (batcher, mut frame_rx) = Batcher::spawn(config.batching.clone());

    let manager = Arc::new(ConnectionManager::new(
        transport.clone(),
        config.clone(),
        health_registry.clone(),
    ));
    let engine = Arc::new(RequestEngine::new(
        manager,
        transport,
        config_view,
        browser,
        config.clone(),
        batcher,
    ));
    let _engine = engine;

    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            info!(device_uid = %frame.device_uid, trans_id = frame.trans_id, "asyncTagsValues frame ready for dispatch");
        }
    });

    let metrics_server = MetricsServer::new(config.metrics_port);
    tokio::spawn(async move {
        if let Err(e) = metrics_server.serve().await {
            error!("metrics server error: {e}");
        }
    });
    info!(port = config.metrics_port, "metrics server listening");

    let health_server = HealthServer::new(config.health_port, health_registry);
    tokio::spawn(async move {
        if let Err(e) = health_server.serve().await {
            error!("health server error: {e}");
        }
    });
    info!(port = config.health_port, "health server listening");

    info!("engine ready, listening for shutdown signals (SIGTERM, SIGINT)");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT (Ctrl+C) received, initiating graceful shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to create SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received, initiating graceful shutdown...");
        }
    }

    info!("OPC UA driver engine stopped successfully");
    Ok(())
}
