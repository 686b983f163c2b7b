//! Config View (CV) — read-only projection over the surrounding
//! configuration object (spec.md §4.7).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::{BrowseTrigger, Device};

/// Read-only accessor layer, plus the two documented mutation hooks the
/// Browser uses (spec.md §3, §4.7, §6). A host backed by a real
/// configuration file implements this trait without the engine needing to
/// know about file I/O.
pub trait ConfigView: Send + Sync {
    fn device(&self, device_uid: &str) -> Option<Device>;
    fn endpoint_url(&self, device_uid: &str) -> Option<String>;
    fn populate_device(&self, device_uid: &str, device: Device);
    fn set_browse_trigger_stop(&self, device_uid: &str);
}

/// In-memory implementation sufficient for tests and for hosts that keep
/// the device list resident rather than backed by a config file.
#[derive(Default)]
pub struct InMemoryConfigView {
    devices: RwLock<HashMap<String, Device>>,
}

impl InMemoryConfigView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Device) {
        self.devices
            .write()
            .unwrap()
            .insert(device.device_uid.clone(), device);
    }
}

impl ConfigView for InMemoryConfigView {
    fn device(&self, device_uid: &str) -> Option<Device> {
        self.devices.read().unwrap().get(device_uid).cloned()
    }

    fn endpoint_url(&self, device_uid: &str) -> Option<String> {
        self.devices
            .read()
            .unwrap()
            .get(device_uid)
            .map(|d| d.endpoint_url.clone())
    }

    fn populate_device(&self, device_uid: &str, device: Device) {
        self.devices.write().unwrap().insert(device_uid.to_string(), device);
    }

    fn set_browse_trigger_stop(&self, device_uid: &str) {
        if let Some(device) = self.devices.write().unwrap().get_mut(device_uid) {
            device.browse_trigger = BrowseTrigger::Stop;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SecurityOptions, TagMap};
    use std::time::Duration;

    fn device(uid: &str) -> Device {
        Device {
            device_uid: uid.to_string(),
            endpoint_url: "opc.tcp://x".to_string(),
            security: SecurityOptions::default(),
            timeout: Duration::from_secs(5),
            browse_trigger: BrowseTrigger::Start,
            tags: TagMap::new(),
        }
    }

    #[test]
    fn missing_device_resolves_to_none() {
        let cv = InMemoryConfigView::new();
        assert!(cv.endpoint_url("ghost").is_none());
    }

    #[test]
    fn set_browse_trigger_stop_mutates_only_that_field() {
        let cv = InMemoryConfigView::new();
        cv.insert(device("D1"));
        cv.set_browse_trigger_stop("D1");
        assert_eq!(cv.device("D1").unwrap().browse_trigger, BrowseTrigger::Stop);
    }
}
