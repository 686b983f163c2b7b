//! Monitor Registry (MR) — per-connection maps from tag name to TagRecord and
//! node-id to NodeRecord, with the monitored-item fan-out index (spec.md §4.2).

use std::collections::HashMap;

use opcua::types::Variant;
use tracing::debug;

use crate::coercion::{get_value_by_index, TagValue};
use crate::model::Tag;

/// A snapshot of a `Tag` used for dispatch, plus runtime state (spec.md §3).
#[derive(Debug, Clone)]
pub struct TagRecord {
    pub tag: Tag,
    pub subscribed: bool,
    pub value: TagValue,
}

impl TagRecord {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            subscribed: false,
            value: TagValue::Null,
        }
    }
}

/// Fan-out entry: one monitored item serving every TagRecord that
/// references its node-id (spec.md §3, §9 "shared-node fan-out").
#[derive(Debug, Default)]
pub struct NodeRecord {
    pub original_value: Option<Variant>,
    pub tag_names: Vec<String>,
}

/// Per-connection registry: tag-name -> TagRecord, node-id -> NodeRecord
/// (spec.md §4.2).
#[derive(Debug, Default)]
pub struct Registry {
    tags: HashMap<String, TagRecord>,
    nodes: HashMap<String, NodeRecord>,
}

/// Outcome of registering one tag, telling the caller whether a new
/// monitored item must be created (spec.md §4.2 step 2/3).
pub enum RegisterOutcome {
    /// The tag's node-id was already monitored; no new monitored item needed.
    JoinedExisting,
    /// The tag's node-id is new; caller must create a monitored item for it.
    NeedsMonitoredItem,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&self, name: &str) -> Option<&TagRecord> {
        self.tags.get(name)
    }

    pub fn contains_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn set_subscribed(&mut self, name: &str, subscribed: bool) {
        if let Some(record) = self.tags.get_mut(name) {
            record.subscribed = subscribed;
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    /// `registerTags` for a single tag (spec.md §4.2). Idempotent: if the
    /// tag name is already registered this is a no-op and returns
    /// `JoinedExisting` (no new monitored item is ever needed in that case).
    pub fn register(&mut self, tag: Tag) -> RegisterOutcome {
        if self.tags.contains_key(&tag.name) {
            return RegisterOutcome::JoinedExisting;
        }

        let node_id = tag.node_id.clone();
        let tag_name = tag.name.clone();

        match self.nodes.get_mut(&node_id) {
            Some(node) => {
                let seeded = get_value_by_index(&tag, node.original_value.as_ref());
                debug!(node_id = %node_id, tag = %tag_name, "joining existing monitored item");
                let mut record = TagRecord::new(tag);
                record.value = seeded;
                self.tags.insert(tag_name.clone(), record);
                node.tag_names.push(tag_name);
                RegisterOutcome::JoinedExisting
            }
            None => {
                debug!(node_id = %node_id, tag = %tag_name, "registering new monitored item");
                self.tags.insert(tag_name.clone(), TagRecord::new(tag));
                self.nodes.insert(
                    node_id,
                    NodeRecord {
                        original_value: None,
                        tag_names: vec![tag_name],
                    },
                );
                RegisterOutcome::NeedsMonitoredItem
            }
        }
    }

    /// Applies a raw data-change update for a node-id, projecting into every
    /// fan-out TagRecord in list order (spec.md §4.5, §8 "fan-out
    /// correctness"). Returns the `(tagName, projected)` pairs for tags that
    /// are `subscribed`, in TagRecord order.
    pub fn apply_data_change(&mut self, node_id: &str, raw: Variant) -> Vec<(String, TagValue)> {
        let Some(node) = self.nodes.get_mut(node_id) else {
            debug!(node_id, "data-change for unknown node, dropping");
            return Vec::new();
        };
        node.original_value = Some(raw);

        let mut outbound = Vec::new();
        for tag_name in &node.tag_names {
            let Some(record) = self.tags.get_mut(tag_name) else {
                continue;
            };
            record.value = get_value_by_index(&record.tag, node.original_value.as_ref());
            if record.subscribed {
                outbound.push((tag_name.clone(), record.value.clone()));
            }
        }
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TagType;

    fn tag(name: &str, node_id: &str, array_index: i32) -> Tag {
        Tag {
            name: name.to_string(),
            tag_type: TagType::Float,
            read: true,
            write: true,
            node_id: node_id.to_string(),
            node_type: 11,
            array_index,
        }
    }

    #[test]
    fn second_tag_on_same_node_joins_without_new_monitored_item() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.register(tag("a0", "ns=2;s=Arr", 0)),
            RegisterOutcome::NeedsMonitoredItem
        ));
        assert!(matches!(
            reg.register(tag("a3", "ns=2;s=Arr", 3)),
            RegisterOutcome::JoinedExisting
        ));
        assert_eq!(reg.node("ns=2;s=Arr").unwrap().tag_names.len(), 2);
    }

    #[test]
    fn seed_on_register_uses_existing_original_value() {
        let mut reg = Registry::new();
        reg.register(tag("a0", "ns=2;s=Arr", 0));
        reg.apply_data_change("ns=2;s=Arr", Variant::from(vec![1.0f64, 2.0, 3.0, 4.0]));

        reg.register(tag("a3", "ns=2;s=Arr", 3));
        assert_eq!(reg.tag("a3").unwrap().value, TagValue::Number(4.0));
    }

    #[test]
    fn fan_out_applies_in_tag_record_order() {
        let mut reg = Registry::new();
        reg.register(tag("a0", "ns=2;s=Arr", 0));
        reg.register(tag("a3", "ns=2;s=Arr", 3));
        reg.set_subscribed("a0", true);
        reg.set_subscribed("a3", true);

        let outbound = reg.apply_data_change("ns=2;s=Arr", Variant::from(vec![1.0f64, 2.0, 3.0, 4.0]));
        assert_eq!(
            outbound,
            vec![
                ("a0".to_string(), TagValue::Number(1.0)),
                ("a3".to_string(), TagValue::Number(4.0)),
            ]
        );
    }

    #[test]
    fn unknown_node_data_change_is_dropped() {
        let mut reg = Registry::new();
        let outbound = reg.apply_data_change("ns=9;s=Ghost", Variant::from(1.0f64));
        assert!(outbound.is_empty());
    }
}
