//! In-memory `OpcTransport` used by unit and integration tests (spec.md
//! §4.1 Full), grounded in the teacher's mock-driver pattern for trait-seam
//! testability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use opcua::types::Variant;
use tokio::sync::mpsc;

use crate::browser::{BrowsedReference, NodeClass};
use crate::connection::{
    DataChangeEvent, MonitoredItemId, MonitoredItemParams, OpcTransport, SessionEvent, SessionId,
    SubscriptionId, SubscriptionParams,
};
use crate::errors::{EngineError, EngineResult};
use crate::model::SecurityOptions;

#[derive(Default)]
struct MockState {
    values: HashMap<String, Variant>,
    children: HashMap<String, Vec<BrowsedReference>>,
}

/// A scriptable mock OPC UA server: preload node values and a browse tree,
/// then observe writes and monitored-item registrations.
pub struct MockTransport {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    fail_connect: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            fail_connect: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::new()
        }
    }

    pub fn set_value(&self, node_id: &str, value: Variant) {
        self.state.lock().unwrap().values.insert(node_id.to_string(), value);
    }

    pub fn value(&self, node_id: &str) -> Option<Variant> {
        self.state.lock().unwrap().values.get(node_id).cloned()
    }

    pub fn set_children(&self, node_id: &str, children: Vec<BrowsedReference>) {
        self.state
            .lock()
            .unwrap()
            .children
            .insert(node_id.to_string(), children);
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl OpcTransport for MockTransport {
    async fn connect(
        &self,
        _endpoint_url: &str,
        _security: &SecurityOptions,
        _timeout: Duration,
        _events: mpsc::UnboundedSender<SessionEvent>,
    ) -> EngineResult<SessionId> {
        if self.fail_connect {
            return Err(EngineError::OpcReject("mock connect failure".to_string()));
        }
        Ok(self.next())
    }

    async fn create_subscription(
        &self,
        _session: SessionId,
        _params: &SubscriptionParams,
    ) -> EngineResult<SubscriptionId> {
        Ok(self.next())
    }

    async fn create_monitored_item(
        &self,
        _session: SessionId,
        _subscription: SubscriptionId,
        node_id: &str,
        _params: &MonitoredItemParams,
        data_change: mpsc::UnboundedSender<DataChangeEvent>,
    ) -> EngineResult<MonitoredItemId> {
        if let Some(value) = self.value(node_id) {
            let _ = data_change.send(DataChangeEvent {
                node_id: node_id.to_string(),
                value,
            });
        }
        Ok(self.next())
    }

    async fn read_value(&self, _session: SessionId, node_id: &str) -> EngineResult<Variant> {
        self.value(node_id)
            .ok_or_else(|| EngineError::ConfigError(format!("no value for {node_id}")))
    }

    async fn write_value(
        &self,
        _session: SessionId,
        node_id: &str,
        value: Variant,
    ) -> EngineResult<()> {
        self.set_value(node_id, value);
        Ok(())
    }

    async fn browse_children(
        &self,
        _session: SessionId,
        node_id: &str,
    ) -> EngineResult<Vec<BrowsedReference>> {
        Ok(self.state.lock().unwrap().children.get(node_id).cloned().unwrap_or_default())
    }

    async fn close_session(&self, _session: SessionId) {}

    async fn disconnect(&self, _session: SessionId) {}
}

/// Convenience constructor for a Variable reference with a preloaded value,
/// for building a mock browse tree (spec.md §8 scenario 5).
pub fn variable_ref(display_name: &str, node_id: &str, data_type_code: u32, value: Variant) -> BrowsedReference {
    BrowsedReference {
        display_name: display_name.to_string(),
        node_id: node_id.to_string(),
        node_class: NodeClass::Variable,
        value: Some(value),
        data_type_code,
    }
}

pub fn object_ref(display_name: &str, node_id: &str) -> BrowsedReference {
    BrowsedReference {
        display_name: display_name.to_string(),
        node_id: node_id.to_string(),
        node_class: NodeClass::Object,
        value: None,
        data_type_code: 0,
    }
}
