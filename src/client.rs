//! Real OPC UA transport, backed by the `opcua` crate's async client
//! (spec.md §4.1 Full). Grounded in `tlspuffin-async-opcua`'s
//! `samples/custom-structures-client` connect sequence and its
//! `lib/tests/integration/subscriptions.rs` subscription/monitored-item
//! flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::{ClientBuilder, IdentityToken, MonitoredItem, OnSubscriptionNotification, Session};
use opcua::crypto::SecurityPolicy as OpcSecurityPolicy;
use opcua::types::{
    AttributeId, BrowseDescription, BrowseDirection, DataValue, MessageSecurityMode,
    MonitoredItemCreateRequest, MonitoringMode, MonitoringParameters, NodeClass as OpcNodeClass,
    NodeId as OpcNodeId, ReadValueId, ReferenceTypeId, TimestampsToReturn, UserTokenPolicy,
    Variant, WriteValue,
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::browser::{BrowsedReference, NodeClass};
use crate::connection::{
    DataChangeEvent, MonitoredItemId, MonitoredItemParams, OpcTransport, SessionEvent, SessionId,
    SubscriptionId, SubscriptionParams,
};
use crate::errors::{EngineError, EngineResult};
use crate::model::{SecurityMode, SecurityOptions, SecurityPolicy as TagSecurityPolicy};

/// The sender a subscription's callback forwards data values to. `opcua`
/// fixes the callback at `create_subscription` time, but our `OpcTransport`
/// seam only learns the device's `data_tx` later, at the first
/// `create_monitored_item` call — so the slot starts empty and
/// `create_monitored_item` fills it in once the real sender is known.
type DataChangeSlot = Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<DataChangeEvent>>>>;

/// Forwards subscription notifications into the Connection Manager's
/// per-device data-change channel (spec.md §4.5's first hop into the
/// engine).
struct ChannelNotificationSink {
    data_change: DataChangeSlot,
}

impl OnSubscriptionNotification for ChannelNotificationSink {
    fn on_data_value(&mut self, notification: DataValue, item: &MonitoredItem) {
        let Some(value) = notification.value else {
            return;
        };
        let slot = self.data_change.lock().unwrap();
        if let Some(sender) = slot.as_ref() {
            let _ = sender.send(DataChangeEvent {
                node_id: item.item_to_monitor().node_id.to_string(),
                value,
            });
        }
    }
}

/// `OpcTransport` backed by a real server connection, one `opcua::client::Session`
/// per `connect` call (spec.md §4.1).
#[derive(Default)]
pub struct OpcUaTransport {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    subscription_sinks: Mutex<HashMap<SubscriptionId, DataChangeSlot>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl OpcUaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    async fn session_for(&self, session: SessionId) -> EngineResult<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::EmptySession(session.to_string()))
    }
}

fn map_security(security: &SecurityOptions) -> (OpcSecurityPolicy, MessageSecurityMode) {
    let policy = match security.security_policy {
        TagSecurityPolicy::None => OpcSecurityPolicy::None,
        TagSecurityPolicy::Basic128 => OpcSecurityPolicy::Basic128Rsa15,
        TagSecurityPolicy::Basic128Rsa15 => OpcSecurityPolicy::Basic128Rsa15,
        TagSecurityPolicy::Basic192 => OpcSecurityPolicy::Basic192,
        TagSecurityPolicy::Basic192Rsa15 => OpcSecurityPolicy::Basic192Rsa15,
        TagSecurityPolicy::Basic256 => OpcSecurityPolicy::Basic256,
        TagSecurityPolicy::Basic256Rsa15 => OpcSecurityPolicy::Basic256Rsa15,
        TagSecurityPolicy::Basic256Sha256 => OpcSecurityPolicy::Basic256Sha256,
        TagSecurityPolicy::Aes128_Sha256_RsaOaep => OpcSecurityPolicy::Aes128Sha256RsaOaep,
        TagSecurityPolicy::Aes256_Sha256_RsaPss => OpcSecurityPolicy::Aes256Sha256RsaPss,
    };
    let mode = match security.security_mode {
        SecurityMode::None => MessageSecurityMode::None,
        SecurityMode::Sign => MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    };
    (policy, mode)
}

fn identity_token(security: &SecurityOptions) -> IdentityToken {
    if security.anonymous {
        IdentityToken::Anonymous
    } else {
        IdentityToken::UserName(
            security.user_name.clone().unwrap_or_default(),
            security.password.clone().unwrap_or_default(),
        )
    }
}

fn map_node_class(class: OpcNodeClass) -> NodeClass {
    match class {
        OpcNodeClass::Object => NodeClass::Object,
        OpcNodeClass::Variable => NodeClass::Variable,
        _ => NodeClass::Other,
    }
}

#[async_trait]
impl OpcTransport for OpcUaTransport {
    async fn connect(
        &self,
        endpoint_url: &str,
        security: &SecurityOptions,
        timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> EngineResult<SessionId> {
        let (policy, mode) = map_security(security);
        let client = ClientBuilder::new()
            .application_name("opcua-driver-engine")
            .application_uri("urn:opcua-driver-engine")
            .product_uri("urn:opcua-driver-engine")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(1)
            .client()
            .map_err(|errs| EngineError::OpcReject(errs.join("; ")))?;

        let connect = client.connect_to_matching_endpoint(
            (endpoint_url, policy.to_str(), mode, UserTokenPolicy::anonymous()),
            identity_token(security),
        );

        let (session, event_loop) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| EngineError::OpcReject("connect timed out".to_string()))?
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        let join = event_loop.spawn();
        session.wait_for_connection().await;

        // The event loop's join handle resolves once the session tears down
        // for good; that is this transport's only signal for the CM's
        // "any -> Absent" transition (spec.md §4.1, §7).
        tokio::spawn(async move {
            match join.await {
                Ok(status) if status.is_good() => {
                    let _ = events.send(SessionEvent::Terminated);
                }
                Ok(status) => {
                    let _ = events.send(SessionEvent::Error(status.to_string()));
                }
                Err(e) => {
                    let _ = events.send(SessionEvent::Error(e.to_string()));
                }
            }
        });

        let id = self.next();
        self.sessions.lock().await.insert(id, session);
        Ok(id)
    }

    async fn create_subscription(
        &self,
        session: SessionId,
        params: &SubscriptionParams,
    ) -> EngineResult<SubscriptionId> {
        let session = self.session_for(session).await?;
        let slot: DataChangeSlot = Arc::new(std::sync::Mutex::new(None));
        let sub_id = session
            .create_subscription(
                Duration::from_millis(params.publishing_interval_ms as u64),
                params.lifetime_count,
                params.max_keep_alive_count,
                params.max_notifications_per_publish,
                params.priority,
                true,
                ChannelNotificationSink {
                    data_change: slot.clone(),
                },
            )
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;
        self.subscription_sinks.lock().await.insert(sub_id as u64, slot);
        Ok(sub_id as u64)
    }

    async fn create_monitored_item(
        &self,
        session: SessionId,
        subscription: SubscriptionId,
        node_id: &str,
        params: &MonitoredItemParams,
        data_change: mpsc::UnboundedSender<DataChangeEvent>,
    ) -> EngineResult<MonitoredItemId> {
        let session = self.session_for(session).await?;
        let node: OpcNodeId = node_id
            .parse()
            .map_err(|_| EngineError::ConfigError(format!("invalid node-id: {node_id}")))?;

        let results = session
            .create_monitored_items(
                subscription as u32,
                TimestampsToReturn::Both,
                vec![MonitoredItemCreateRequest {
                    item_to_monitor: ReadValueId {
                        node_id: node,
                        attribute_id: AttributeId::Value as u32,
                        ..Default::default()
                    },
                    monitoring_mode: MonitoringMode::Reporting,
                    requested_parameters: MonitoringParameters {
                        sampling_interval: params.sampling_interval_ms,
                        queue_size: params.queue_size,
                        discard_oldest: params.discard_oldest,
                        ..Default::default()
                    },
                }],
            )
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        let Some(result) = results.into_iter().next() else {
            return Err(EngineError::OpcReject("empty create_monitored_items response".to_string()));
        };
        if !result.status_code.is_good() {
            return Err(EngineError::OpcReject(result.status_code.to_string()));
        }

        if let Some(slot) = self.subscription_sinks.lock().await.get(&subscription).cloned() {
            *slot.lock().unwrap() = Some(data_change.clone());
        }

        // The initial queued publish usually delivers a data-change shortly
        // after the monitored item is created; this read is a belt-and-
        // suspenders seed so `read()` doesn't have to wait on it.
        let node_id_owned = node_id.to_string();
        if let Some(initial) = session
            .read(
                &[ReadValueId {
                    node_id: node_id_owned.parse().unwrap_or_default(),
                    attribute_id: AttributeId::Value as u32,
                    ..Default::default()
                }],
                TimestampsToReturn::Both,
                0.0,
            )
            .await
            .ok()
            .and_then(|mut v| v.pop())
            .and_then(|dv| dv.value)
        {
            let _ = data_change.send(DataChangeEvent {
                node_id: node_id_owned,
                value: initial,
            });
        }

        Ok(self.next())
    }

    async fn read_value(&self, session: SessionId, node_id: &str) -> EngineResult<Variant> {
        let session = self.session_for(session).await?;
        let node: OpcNodeId = node_id
            .parse()
            .map_err(|_| EngineError::ConfigError(format!("invalid node-id: {node_id}")))?;

        let mut results = session
            .read(
                &[ReadValueId {
                    node_id: node,
                    attribute_id: AttributeId::Value as u32,
                    ..Default::default()
                }],
                TimestampsToReturn::Neither,
                0.0,
            )
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        results
            .pop()
            .and_then(|dv| dv.value)
            .ok_or_else(|| EngineError::ConfigError(format!("no value for {node_id}")))
    }

    async fn write_value(
        &self,
        session: SessionId,
        node_id: &str,
        value: Variant,
    ) -> EngineResult<()> {
        let session = self.session_for(session).await?;
        let node: OpcNodeId = node_id
            .parse()
            .map_err(|_| EngineError::ConfigError(format!("invalid node-id: {node_id}")))?;

        let results = session
            .write(&[WriteValue {
                node_id: node,
                attribute_id: AttributeId::Value as u32,
                index_range: Default::default(),
                value: DataValue {
                    value: Some(value),
                    status: None,
                    source_timestamp: None,
                    source_picoseconds: None,
                    server_timestamp: None,
                    server_picoseconds: None,
                },
            }])
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        match results.into_iter().next() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(EngineError::WriteFail(status.to_string())),
            None => Err(EngineError::WriteFail("empty write response".to_string())),
        }
    }

    async fn browse_children(
        &self,
        session: SessionId,
        node_id: &str,
    ) -> EngineResult<Vec<BrowsedReference>> {
        let session = self.session_for(session).await?;
        let node: OpcNodeId = node_id
            .parse()
            .map_err(|_| EngineError::ConfigError(format!("invalid node-id: {node_id}")))?;

        let results = session
            .browse(
                &[BrowseDescription {
                    node_id: node,
                    browse_direction: BrowseDirection::Forward,
                    reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
                    include_subtypes: true,
                    node_class_mask: 0,
                    result_mask: 0x3f,
                }],
                0,
                None,
            )
            .await
            .map_err(|e| EngineError::OpcReject(e.to_string()))?;

        let Some(result) = results.into_iter().next() else {
            return Ok(Vec::new());
        };
        if !result.status_code.is_good() {
            warn!(node_id, status = %result.status_code, "browse returned non-good status");
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for reference in result.references.unwrap_or_default() {
            let child_node_id = reference.node_id.node_id.to_string();
            let value = if reference.node_class == OpcNodeClass::Variable {
                session
                    .read(
                        &[ReadValueId {
                            node_id: reference.node_id.node_id.clone(),
                            attribute_id: AttributeId::Value as u32,
                            ..Default::default()
                        }],
                        TimestampsToReturn::Neither,
                        0.0,
                    )
                    .await
                    .ok()
                    .and_then(|mut v| v.pop())
                    .and_then(|dv| dv.value)
            } else {
                None
            };

            out.push(BrowsedReference {
                display_name: reference.display_name.text.to_string(),
                node_id: child_node_id,
                node_class: map_node_class(reference.node_class),
                value,
                data_type_code: 0,
            });
        }
        Ok(out)
    }

    async fn close_session(&self, _session: SessionId) {}

    async fn disconnect(&self, session: SessionId) {
        let removed = self.sessions.lock().await.remove(&session);
        if let Some(session) = removed {
            let _ = session.disconnect().await;
        }
    }
}
