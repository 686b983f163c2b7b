//! Request Engine (RE) — dispatches supervisor read/write/browse/status/
//! restart requests (spec.md §4.3).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::browser::{populate_device, Browser, ProgressSink};
use crate::change_pump::NotificationSink;
use crate::coercion::{get_set_value, splice_array_element, TagValue};
use crate::config::Config;
use crate::config_view::ConfigView;
use crate::connection::{
    ConnectionKey, ConnectionManager, MonitoredItemParams, OpcTransport, RecordHandle,
};
use crate::errors::{EngineError, EngineResult};
use crate::model::Tag;
use crate::registry::RegisterOutcome;

pub struct RequestEngine<T: OpcTransport> {
    manager: Arc<ConnectionManager<T>>,
    transport: Arc<T>,
    config_view: Arc<dyn ConfigView>,
    browser: Arc<Browser>,
    config: Arc<Config>,
    sink: Arc<dyn NotificationSink>,
}

impl<T: OpcTransport + 'static> RequestEngine<T> {
    pub fn new(
        manager: Arc<ConnectionManager<T>>,
        transport: Arc<T>,
        config_view: Arc<dyn ConfigView>,
        browser: Arc<Browser>,
        config: Arc<Config>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            manager,
            transport,
            config_view,
            browser,
            config,
            sink,
        }
    }

    fn device_or_not_found(&self, device_uid: &str) -> EngineResult<crate::model::Device> {
        self.config_view
            .device(device_uid)
            .filter(|d| !d.endpoint_url.is_empty())
            .ok_or_else(|| EngineError::DeviceIdNotFound(device_uid.to_string()))
    }

    /// `status(deviceUid)` (spec.md §4.3). Never fails: an unknown device or
    /// a connection attempt failure both resolve to `false`.
    pub async fn status(self: &Arc<Self>, device_uid: &str) -> bool {
        let Ok(device) = self.device_or_not_found(device_uid) else {
            return false;
        };
        let key = ConnectionKey {
            endpoint_url: device.endpoint_url.clone(),
            device_uid: device.device_uid.clone(),
        };
        if let Some(existing) = self.manager.get(&key).await {
            if existing.lock().await.connected {
                return true;
            }
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.manager.ensure_connection(&device, engine.sink.clone()).await {
                warn!(device_uid = %device.device_uid, error = %e, "background ensureConnection failed");
            }
        });
        false
    }

    /// `read(deviceUid, [tagName])` (spec.md §4.3). Self-bootstrapping: any
    /// requested tag not yet in the registry is registered on the spot, and
    /// marked `subscribed` since the supervisor is now actively asking for
    /// it (spec.md §4.5 delivers change notifications only for `subscribed`
    /// tags).
    pub async fn read(
        self: &Arc<Self>,
        device_uid: &str,
        tag_names: &[String],
    ) -> EngineResult<Vec<Result<TagValue, EngineError>>> {
        let device = self.device_or_not_found(device_uid)?;
        let handle = self
            .manager
            .ensure_connection(&device, self.sink.clone())
            .await?;

        let mut out = Vec::with_capacity(tag_names.len());
        for tag_name in tag_names {
            let result = self.read_one(&device, &handle, tag_name).await;
            let outcome = if result.is_ok() { "ok" } else { "err" };
            crate::metrics::READS.with_label_values(&[device_uid, outcome]).inc();
            out.push(result);
        }
        Ok(out)
    }

    async fn read_one(
        &self,
        device: &crate::model::Device,
        handle: &RecordHandle,
        tag_name: &str,
    ) -> Result<TagValue, EngineError> {
        let Some(tag) = device.tag_by_name(tag_name).cloned() else {
            return Err(EngineError::TagNotFound(tag_name.to_string()));
        };

        self.check_if_tags_in_monitor(&device.device_uid, handle, std::slice::from_ref(&tag))
            .await?;

        let record = handle.lock().await;
        Ok(record
            .registry
            .tag(tag_name)
            .map(|t| t.value.clone())
            .unwrap_or(TagValue::Null))
    }

    /// `checkIfTagsInMonitor` (spec.md §4.2): registers any tag not already
    /// in the registry, creating a monitored item when its node-id is new,
    /// and marks every tag passed through here `subscribed` — this is the
    /// real dispatch path's only caller, so a tag only streams change
    /// notifications once the supervisor has actually read it at least once.
    async fn check_if_tags_in_monitor(
        &self,
        device_uid: &str,
        handle: &RecordHandle,
        tags: &[Tag],
    ) -> EngineResult<()> {
        for tag in tags {
            let (session, subscription, data_tx, already_present) = {
                let record = handle.lock().await;
                (
                    record.session,
                    record.subscription,
                    record.data_tx.clone(),
                    record.registry.contains_tag(&tag.name),
                )
            };
            if already_present {
                handle.lock().await.registry.set_subscribed(&tag.name, true);
                continue;
            }

            let outcome = {
                let mut record = handle.lock().await;
                let outcome = record.registry.register(tag.clone());
                record.registry.set_subscribed(&tag.name, true);
                outcome
            };

            if let RegisterOutcome::NeedsMonitoredItem = outcome {
                let (Some(session), Some(subscription), Some(data_tx)) =
                    (session, subscription, data_tx)
                else {
                    return Err(EngineError::EmptySession(tag.node_id.clone()));
                };
                let params = MonitoredItemParams {
                    sampling_interval_ms: self.config.monitored_item.sampling_interval_ms,
                    queue_size: self.config.monitored_item.queue_size,
                    discard_oldest: self.config.monitored_item.discard_oldest,
                };
                self.transport
                    .create_monitored_item(session, subscription, &tag.node_id, &params, data_tx)
                    .await
                    .map_err(|e| EngineError::OpcReject(e.to_string()))?;
                crate::metrics::MONITORED_ITEMS.with_label_values(&[device_uid]).inc();
            }
        }
        Ok(())
    }

    /// `write(deviceUid, [{tagName: setValue}])` (spec.md §4.3). Every tag is
    /// attempted even after an earlier one fails — a typo in one tag name
    /// must not stop the rest of the batch from reaching the device. Only
    /// the first error encountered is returned to the caller.
    pub async fn write(
        self: &Arc<Self>,
        device_uid: &str,
        writes: &[(String, TagValue)],
    ) -> EngineResult<()> {
        let device = self.device_or_not_found(device_uid)?;
        let handle = self
            .manager
            .ensure_connection(&device, self.sink.clone())
            .await?;

        let mut first_error = None;
        for (tag_name, set_value) in writes {
            let result = self.write_one(&device, &handle, tag_name, set_value).await;
            let outcome = if result.is_ok() { "ok" } else { "err" };
            crate::metrics::WRITES.with_label_values(&[device_uid, outcome]).inc();
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write_one(
        &self,
        device: &crate::model::Device,
        handle: &RecordHandle,
        tag_name: &str,
        set_value: &TagValue,
    ) -> EngineResult<()> {
        let Some(tag) = device.tag_by_name(tag_name).cloned() else {
            return Err(EngineError::TagNotFound(tag_name.to_string()));
        };
        if !tag.write {
            return Err(EngineError::TagNotWriteable(tag_name.to_string()));
        }

        let session = handle
            .lock()
            .await
            .session
            .ok_or_else(|| EngineError::EmptySession(tag_name.to_string()))?;

        let new_scalar = get_set_value(&tag, set_value)
            .map_err(|e| EngineError::ConfigError(format!("{tag_name}: {e}")))?;

        let value_to_write = if tag.is_array_element() {
            let original = {
                let record = handle.lock().await;
                record
                    .registry
                    .node(&tag.node_id)
                    .and_then(|n| n.original_value.clone())
            };
            let Some(original) = original else {
                return Err(EngineError::EmptySession(tag.node_id.clone()));
            };
            splice_array_element(&original, tag.array_index as usize, new_scalar)
                .map_err(|e| EngineError::ConfigError(format!("{tag_name}: {e}")))?
        } else {
            new_scalar
        };

        self.transport
            .write_value(session, &tag.node_id, value_to_write)
            .await
            .map_err(|e| EngineError::WriteFail(format!("{tag_name}: {e}")))
    }

    /// `browse(deviceUid)` (spec.md §4.4). Concurrent triggers are silently
    /// dropped — only one browse runs process-wide at a time.
    pub async fn browse(
        self: &Arc<Self>,
        device_uid: &str,
        progress: &dyn ProgressSink,
    ) -> EngineResult<()> {
        let device = self.device_or_not_found(device_uid)?;
        let Some(progress_id) = self.browser.try_acquire().await else {
            debug!(device_uid, "browse already in progress, dropping trigger");
            return Ok(());
        };

        let handle = self
            .manager
            .ensure_connection(&device, self.sink.clone())
            .await?;
        let session = handle
            .lock()
            .await
            .session
            .ok_or_else(|| EngineError::EmptySession(device_uid.to_string()))?;

        let discovered = self
            .browser
            .browse(&self.manager, self.transport.as_ref(), session, progress_id, progress)
            .await;
        crate::metrics::BROWSES.with_label_values(&[device_uid, "ok"]).inc();

        // Population only happens on success (spec.md §9: a failed browse
        // must leave the prior tag set intact). `Browser::browse` above
        // already logs and continues past per-node failures, so reaching
        // here always counts as success for population purposes.
        let mut device = device;
        populate_device(&mut device, discovered);
        self.config_view.populate_device(device_uid, device);
        self.config_view.set_browse_trigger_stop(device_uid);

        Ok(())
    }

    /// `restart(deviceUid)` (spec.md §4.3): destroys the current connection,
    /// if any; the next read/write reconnects.
    pub async fn restart(&self, device_uid: &str) -> EngineResult<()> {
        let device = self.device_or_not_found(device_uid)?;
        let key = ConnectionKey {
            endpoint_url: device.endpoint_url,
            device_uid: device.device_uid,
        };
        self.manager.destroy(&key, "restart").await;
        Ok(())
    }
}
