//! Connection Manager (CM) — per-device OPC UA client lifecycle (spec.md §4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcua::types::Variant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{EngineError, EngineResult};
use crate::model::{Device, SecurityOptions};
use crate::registry::Registry;

pub type SessionId = u64;
pub type SubscriptionId = u64;
pub type MonitoredItemId = u64;

/// `(endpointUrl, deviceUid)` — the composite Connection Record key
/// (spec.md §3, §9 "ad-hoc reconstructed keys"). Never collapse this to
/// `endpointUrl` alone: two devices may share an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub endpoint_url: String,
    pub device_uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Sessioned,
    Subscribed,
}

#[derive(Debug, Clone)]
pub struct SubscriptionParams {
    pub publishing_interval_ms: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct MonitoredItemParams {
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Raw data-change notification delivered to the Change Pump (spec.md §4.5).
#[derive(Debug)]
pub struct DataChangeEvent {
    pub node_id: String,
    pub value: Variant,
}

/// Asynchronous session-level events that trigger CM's "any -> Absent"
/// transition (spec.md §4.1, §7).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Terminated,
    Error(String),
    Backoff,
}

/// Abstraction over the real OPC UA client library, so the engine is
/// testable without a live server (spec.md §4.1 Full).
#[async_trait]
pub trait OpcTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint_url: &str,
        security: &SecurityOptions,
        timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> EngineResult<SessionId>;

    async fn create_subscription(
        &self,
        session: SessionId,
        params: &SubscriptionParams,
    ) -> EngineResult<SubscriptionId>;

    async fn create_monitored_item(
        &self,
        session: SessionId,
        subscription: SubscriptionId,
        node_id: &str,
        params: &MonitoredItemParams,
        data_change: mpsc::UnboundedSender<DataChangeEvent>,
    ) -> EngineResult<MonitoredItemId>;

    async fn read_value(&self, session: SessionId, node_id: &str) -> EngineResult<Variant>;

    async fn write_value(
        &self,
        session: SessionId,
        node_id: &str,
        value: Variant,
    ) -> EngineResult<()>;

    async fn browse_children(
        &self,
        session: SessionId,
        node_id: &str,
    ) -> EngineResult<Vec<crate::browser::BrowsedReference>>;

    async fn close_session(&self, session: SessionId);

    async fn disconnect(&self, session: SessionId);
}

/// A live (or in-progress) Connection Record (spec.md §3).
pub struct ConnectionRecord {
    pub state: ConnectionState,
    pub connected: bool,
    pub session: Option<SessionId>,
    pub subscription: Option<SubscriptionId>,
    pub registry: Registry,
    /// Shared by every monitored item on this connection; new monitored
    /// items clone this sender so all of a device's data-change events feed
    /// one drain task (spec.md §4.2, §4.5).
    pub data_tx: Option<mpsc::UnboundedSender<DataChangeEvent>>,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            state: ConnectionState::Absent,
            connected: false,
            session: None,
            subscription: None,
            registry: Registry::new(),
            data_tx: None,
        }
    }
}

pub type RecordHandle = Arc<Mutex<ConnectionRecord>>;

/// Owns the Connection Records map (spec.md §5 "the Connection Records map
/// is the only mutable shared state"). Map membership is guarded by an
/// `RwLock`; each record is additionally guarded by its own `Mutex` so
/// unrelated devices never serialize on one another.
pub struct ConnectionManager<T: OpcTransport> {
    transport: Arc<T>,
    config: Arc<Config>,
    records: RwLock<HashMap<ConnectionKey, RecordHandle>>,
    health: Arc<crate::health::HealthRegistry>,
}

impl<T: OpcTransport + 'static> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        config: Arc<Config>,
        health: Arc<crate::health::HealthRegistry>,
    ) -> Self {
        Self {
            transport,
            config,
            records: RwLock::new(HashMap::new()),
            health,
        }
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<RecordHandle> {
        self.records.read().await.get(key).cloned()
    }

    /// `ensureConnection(deviceUid, tagsToMonitor)` (spec.md §4.1). Returns
    /// the existing record if already `Subscribed`, otherwise drives the
    /// state machine from `Absent` through `Connecting`/`Sessioned` to
    /// `Subscribed`. `sink` receives every data-change event observed on
    /// this connection for as long as it lives (spec.md §4.5).
    /// The check-for-existing-record and insert-a-new-one steps happen under
    /// one hold of the map's write lock, so two concurrent callers for the
    /// same key can never both decide to drive a fresh connect — the loser
    /// observes the winner's handle and waits on it instead.
    pub async fn ensure_connection(
        self: &Arc<Self>,
        device: &Device,
        sink: Arc<dyn crate::change_pump::NotificationSink>,
    ) -> EngineResult<RecordHandle> {
        let key = ConnectionKey {
            endpoint_url: device.endpoint_url.clone(),
            device_uid: device.device_uid.clone(),
        };

        let (handle, owns_connect) = {
            let mut records = self.records.write().await;
            match records.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let handle: RecordHandle = Arc::new(Mutex::new(ConnectionRecord::new()));
                    records.insert(key.clone(), handle.clone());
                    (handle, true)
                }
            }
        };

        if !owns_connect {
            if handle.lock().await.state == ConnectionState::Subscribed {
                return Ok(handle);
            }
            return self.wait_for_subscribed(&key, handle).await;
        }

        handle.lock().await.state = ConnectionState::Connecting;
        self.health
            .set(&key.device_uid, crate::health::DeviceHealthState::Connecting)
            .await;
        info!(device_uid = %key.device_uid, endpoint_url = %key.endpoint_url, "connecting");

        if let Err(e) = self.drive_to_subscribed(&key, &handle, device, sink).await {
            self.destroy(&key, "connect_failed").await;
            return Err(e);
        }

        Ok(handle)
    }

    /// Polls a record some other caller is already driving to `Subscribed`,
    /// rather than racing a second connect attempt for the same key.
    async fn wait_for_subscribed(&self, key: &ConnectionKey, handle: RecordHandle) -> EngineResult<RecordHandle> {
        loop {
            if handle.lock().await.state == ConnectionState::Subscribed {
                return Ok(handle);
            }
            if self.get(key).await.is_none() {
                return Err(EngineError::OpcReject(format!(
                    "connection attempt for {} failed",
                    key.device_uid
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn drive_to_subscribed(
        self: &Arc<Self>,
        key: &ConnectionKey,
        handle: &RecordHandle,
        device: &Device,
        sink: Arc<dyn crate::change_pump::NotificationSink>,
    ) -> EngineResult<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let session = self
            .transport
            .connect(&device.endpoint_url, &device.security, device.timeout, event_tx)
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        {
            let mut record = handle.lock().await;
            record.state = ConnectionState::Sessioned;
            record.session = Some(session);
        }
        self.health
            .set(&key.device_uid, crate::health::DeviceHealthState::Sessioned)
            .await;

        let sub_params = SubscriptionParams {
            publishing_interval_ms: self.config.subscription.publishing_interval_ms,
            lifetime_count: self.config.subscription.lifetime_count,
            max_keep_alive_count: self.config.subscription.max_keep_alive_count,
            max_notifications_per_publish: self.config.subscription.max_notifications_per_publish,
            priority: self.config.subscription.priority,
        };
        let subscription = self
            .transport
            .create_subscription(session, &sub_params)
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        {
            let mut record = handle.lock().await;
            record.state = ConnectionState::Subscribed;
            record.subscription = Some(subscription);
            record.connected = true;
            record.data_tx = Some(data_tx);
        }
        self.health
            .set(&key.device_uid, crate::health::DeviceHealthState::Subscribed)
            .await;
        crate::metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[&key.device_uid])
            .set(1.0);

        let device_uid = key.device_uid.clone();
        let handle_for_pump = Arc::clone(handle);
        tokio::spawn(async move {
            while let Some(event) = data_rx.recv().await {
                let mut record = handle_for_pump.lock().await;
                crate::change_pump::on_data_change(&device_uid, &mut record.registry, event, sink.as_ref());
            }
        });

        let manager = Arc::clone(self);
        let key_for_task = key.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    SessionEvent::Terminated => {
                        warn!(device_uid = %key_for_task.device_uid, "subscription terminated");
                        manager.destroy(&key_for_task, "terminated").await;
                        break;
                    }
                    SessionEvent::Error(msg) => {
                        error!(device_uid = %key_for_task.device_uid, error = %msg, "subscription error");
                        manager.destroy(&key_for_task, "error").await;
                        break;
                    }
                    SessionEvent::Backoff => {
                        warn!(device_uid = %key_for_task.device_uid, "transport backoff fired");
                        manager.destroy(&key_for_task, "backoff").await;
                        break;
                    }
                }
            }
        });

        info!(device_uid = %key.device_uid, "subscribed");
        Ok(())
    }

    /// Destroys a Connection Record (spec.md §4.1 "any -> Absent"): attempts
    /// `session.close` then `client.disconnect`, swallowing both failures,
    /// then removes the record. The CM issues no automatic reconnect — the
    /// next incoming request triggers a fresh `ensure_connection` (spec.md
    /// §9 open question). `reason` is a free-form label (`"terminated"`,
    /// `"error"`, `"backoff"`, `"restart"`, `"connect_failed"`) recorded on
    /// the destroys-total metric.
    pub async fn destroy(&self, key: &ConnectionKey, reason: &str) {
        let removed = {
            let mut records = self.records.write().await;
            records.remove(key)
        };
        let Some(handle) = removed else {
            return;
        };
        let session = handle.lock().await.session;
        if let Some(session) = session {
            self.transport.close_session(session).await;
            self.transport.disconnect(session).await;
        }
        self.health.clear(&key.device_uid).await;
        crate::metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[&key.device_uid])
            .set(0.0);
        crate::metrics::MONITORED_ITEMS
            .with_label_values(&[&key.device_uid])
            .set(0.0);
        crate::metrics::CONNECTION_DESTROYS
            .with_label_values(&[&key.device_uid, reason])
            .inc();
        debug!(device_uid = %key.device_uid, reason, "connection record destroyed");
    }
}
