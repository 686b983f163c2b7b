//! Reference Notification Batcher (spec.md §2 item 9, §6, §9).
//!
//! The 100 ms coalescing window is a property of the supervisor adapter, not
//! of the OPC UA engine proper (spec.md §9). This module ships a reference
//! implementation of that contract so the crate runs end-to-end without an
//! external adapter; a host may instead wire the Change Pump to its own
//! `NotificationSink`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::change_pump::NotificationSink;
use crate::coercion::TagValue;
use crate::config::BatchingConfig;
use crate::frames::AsyncTagsValuesFrame;

/// Coalesces same-key `(deviceUid, tagName)` updates to the latest value
/// within one batching window, then flushes as one `AsyncTagsValuesFrame`
/// per `deviceUid` (spec.md §6, §9).
///
/// `pending` uses a plain `std::sync::Mutex`, not `tokio::sync::Mutex`:
/// `NotificationSink::emit` is a synchronous trait method called from the
/// Change Pump, and the lock is only ever held for a short merge, never
/// across an `.await`.
pub struct Batcher {
    config: BatchingConfig,
    pending: StdMutex<HashMap<String, HashMap<String, TagValue>>>,
    last_request_trans_id: AtomicU64,
    frame_tx: mpsc::UnboundedSender<AsyncTagsValuesFrame>,
}

impl Batcher {
    /// Spawns the flush loop and returns the batcher plus the frame
    /// receiver the host's dispatcher should drain onto the supervisor
    /// socket.
    pub fn spawn(config: BatchingConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<AsyncTagsValuesFrame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let batcher = Arc::new(Self {
            config,
            pending: StdMutex::new(HashMap::new()),
            last_request_trans_id: AtomicU64::new(0),
            frame_tx,
        });

        let flusher = Arc::clone(&batcher);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(flusher.config.window).await;
                flusher.flush().await;
            }
        });

        (batcher, frame_rx)
    }

    /// Tracks the last supervisor request `transID` so generated `transID`s
    /// stay at least `trans_id_margin` away from it (spec.md §6, §9).
    pub fn observe_request_trans_id(&self, trans_id: u64) {
        self.last_request_trans_id.store(trans_id, Ordering::SeqCst);
    }

    async fn flush(&self) {
        let drained: HashMap<String, HashMap<String, TagValue>> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        for (device_uid, values) in drained {
            let trans_id =
                self.last_request_trans_id.load(Ordering::SeqCst) + self.config.trans_id_margin;
            debug!(device_uid, trans_id, count = values.len(), "flushing batch");
            let _ = self.frame_tx.send(AsyncTagsValuesFrame {
                cmd: "asyncTagsValues",
                trans_id,
                device_uid,
                values,
            });
        }
    }
}

impl NotificationSink for Batcher {
    fn emit(&self, device_uid: &str, values: HashMap<String, TagValue>) {
        let mut pending = self.pending.lock().unwrap();
        let bucket = pending.entry(device_uid.to_string()).or_default();
        for (tag_name, value) in values {
            bucket.insert(tag_name, value);
        }
    }
}

/// A fixed-window `transID` allocator usable outside the full `Batcher`
/// (e.g. by a host emitting one notification per change, per spec.md §9).
pub fn next_trans_id(last_request_trans_id: u64, margin: u64) -> u64 {
    last_request_trans_id + margin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trans_id_stays_margin_away() {
        assert_eq!(next_trans_id(100, 10), 110);
    }
}
