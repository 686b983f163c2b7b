//! Passive per-device connection health reporting.
//!
//! The engine performs no automatic reconnection (spec.md §4.1, §9 "On
//! reconnect after destroy, the source relies on the next incoming request
//! to rebuild state; there is no background reconnect"), so this module is
//! deliberately a snapshot reporter, not a retry/circuit-breaker loop: it
//! answers "what does the supervisor operator see right now", it does not
//! drive reconnection behavior itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::connection::ConnectionState;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealthState {
    Absent,
    Connecting,
    Sessioned,
    Subscribed,
}

impl From<ConnectionState> for DeviceHealthState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Absent => DeviceHealthState::Absent,
            ConnectionState::Connecting => DeviceHealthState::Connecting,
            ConnectionState::Sessioned => DeviceHealthState::Sessioned,
            ConnectionState::Subscribed => DeviceHealthState::Subscribed,
        }
    }
}

/// Shared snapshot table, updated by whichever component observes a state
/// transition (Connection Manager on connect/destroy).
#[derive(Default)]
pub struct HealthRegistry {
    devices: RwLock<HashMap<String, DeviceHealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, device_uid: &str, state: DeviceHealthState) {
        self.devices.write().await.insert(device_uid.to_string(), state);
    }

    pub async fn clear(&self, device_uid: &str) {
        self.devices.write().await.remove(device_uid);
    }

    async fn snapshot(&self) -> HashMap<String, DeviceHealthState> {
        self.devices.read().await.clone()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    devices: HashMap<String, DeviceHealthState>,
}

async fn health_handler(State(registry): State<Arc<HealthRegistry>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        devices: registry.snapshot().await,
    })
}

pub struct HealthServer {
    port: u16,
    registry: Arc<HealthRegistry>,
}

impl HealthServer {
    pub fn new(port: u16, registry: Arc<HealthRegistry>) -> Self {
        Self { port, registry }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .with_state(self.registry);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_clear_removes_device() {
        let registry = HealthRegistry::new();
        registry.set("D1", DeviceHealthState::Subscribed).await;
        assert_eq!(registry.snapshot().await.len(), 1);
        registry.clear("D1").await;
        assert!(registry.snapshot().await.is_empty());
    }
}
