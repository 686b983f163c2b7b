//! Change Pump (CP) — applies OPC UA data-change callbacks to the registry
//! and emits supervisor-facing change notifications (spec.md §4.5).

use std::collections::HashMap;

use tracing::debug;

use crate::coercion::TagValue;
use crate::connection::DataChangeEvent;
use crate::registry::Registry;

/// Injection point for the external Batcher (spec.md §4.5, §6 `subscribeHandler`).
pub trait NotificationSink: Send + Sync {
    fn emit(&self, device_uid: &str, values: HashMap<String, TagValue>);
}

/// Drives one `DataChangeEvent` through the registry and the sink (spec.md
/// §4.5 steps 1-4). Returns early (a dropped notification) if the node-id
/// is no longer present, which can race with a concurrent teardown.
pub fn on_data_change(
    device_uid: &str,
    registry: &mut Registry,
    event: DataChangeEvent,
    sink: &dyn NotificationSink,
) {
    let outbound = registry.apply_data_change(&event.node_id, event.value);
    if outbound.is_empty() {
        return;
    }

    let batch: HashMap<String, TagValue> = outbound.into_iter().collect();
    debug!(device_uid, count = batch.len(), "emitting change notification");
    crate::metrics::CHANGE_NOTIFICATIONS.with_label_values(&[device_uid]).inc();
    sink.emit(device_uid, batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tag, TagType};
    use opcua::types::Variant;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        seen: Arc<Mutex<Vec<(String, HashMap<String, TagValue>)>>>,
    }

    impl NotificationSink for RecordingSink {
        fn emit(&self, device_uid: &str, values: HashMap<String, TagValue>) {
            self.seen.lock().unwrap().push((device_uid.to_string(), values));
        }
    }

    fn tag(name: &str, array_index: i32) -> Tag {
        Tag {
            name: name.to_string(),
            tag_type: TagType::Float,
            read: true,
            write: true,
            node_id: "ns=2;s=Arr".to_string(),
            node_type: 11,
            array_index,
        }
    }

    #[test]
    fn unsubscribed_tags_do_not_reach_the_sink() {
        let mut registry = Registry::new();
        registry.register(tag("a0", 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink { seen: seen.clone() };

        on_data_change(
            "D1",
            &mut registry,
            DataChangeEvent {
                node_id: "ns=2;s=Arr".to_string(),
                value: Variant::from(vec![1.0f64, 2.0]),
            },
            &sink,
        );

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(registry.tag("a0").unwrap().value, TagValue::Number(1.0));
    }

    #[test]
    fn subscribed_tag_reaches_the_sink() {
        let mut registry = Registry::new();
        registry.register(tag("a0", 0));
        registry.set_subscribed("a0", true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink { seen: seen.clone() };

        on_data_change(
            "D1",
            &mut registry,
            DataChangeEvent {
                node_id: "ns=2;s=Arr".to_string(),
                value: Variant::from(vec![5.0f64]),
            },
            &sink,
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "D1");
        assert_eq!(seen[0].1.get("a0"), Some(&TagValue::Number(5.0)));
    }
}
