//! Prometheus metrics for the OPC UA driver engine.

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;

lazy_static! {
    /// Number of live (Subscribed) connections, per device.
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        "opcua_active_connections",
        "Number of live OPC UA connections",
        &["device_uid"]
    )
    .unwrap();

    /// Number of monitored items currently registered, per device.
    pub static ref MONITORED_ITEMS: GaugeVec = register_gauge_vec!(
        "opcua_monitored_items",
        "Number of monitored items registered",
        &["device_uid"]
    )
    .unwrap();

    /// Connection Record destroys, by reason (spec.md §4.1 "any -> Absent").
    pub static ref CONNECTION_DESTROYS: CounterVec = register_counter_vec!(
        "opcua_connection_destroys_total",
        "Total Connection Record destroys",
        &["device_uid", "reason"]
    )
    .unwrap();

    /// Read outcomes.
    pub static ref READS: CounterVec = register_counter_vec!(
        "opcua_reads_total",
        "Total read requests",
        &["device_uid", "outcome"]
    )
    .unwrap();

    /// Write outcomes.
    pub static ref WRITES: CounterVec = register_counter_vec!(
        "opcua_writes_total",
        "Total write requests",
        &["device_uid", "outcome"]
    )
    .unwrap();

    /// Browse outcomes.
    pub static ref BROWSES: CounterVec = register_counter_vec!(
        "opcua_browses_total",
        "Total browse requests",
        &["device_uid", "outcome"]
    )
    .unwrap();

    /// Change notifications emitted to the supervisor, per device.
    pub static ref CHANGE_NOTIFICATIONS: CounterVec = register_counter_vec!(
        "opcua_change_notifications_total",
        "Total change notifications emitted",
        &["device_uid"]
    )
    .unwrap();
}

pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
