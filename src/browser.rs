//! Browser (BR) — recursive descent over an OPC UA address space with live
//! progress reporting (spec.md §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opcua::types::Variant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, OpcTransport, SessionId};
use crate::model::{BrowseTrigger, Device, Tag, TagMap, TagType, TagUid};

/// OPC UA `NodeClass` values relevant to browsing (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
    Other,
}

/// One reference returned by a single-level browse call.
#[derive(Debug, Clone)]
pub struct BrowsedReference {
    pub display_name: String,
    pub node_id: String,
    pub node_class: NodeClass,
    /// Present when the node was a Variable and a `Read` succeeded.
    pub value: Option<Variant>,
    /// OPC UA DataType numeric code, 0 if unavailable.
    pub data_type_code: u32,
}

/// One discovered leaf tag, flattened and insertion-ordered (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct DiscoveredTag {
    pub name: String,
    pub node_id: String,
    pub data_type_code: u32,
    pub array_index: i32,
}

#[derive(Debug, Clone)]
pub struct ProgressFrame {
    pub progress_txt: String,
    pub progress_id: u64,
    pub done: bool,
}

/// Injection point for `progressHandler` (spec.md §6).
pub trait ProgressSink: Send + Sync {
    fn emit(&self, frame: ProgressFrame);
}

const ROOT_FOLDER: &str = "i=84";

/// Process-wide browse state, protected by a single driver-level lock
/// (spec.md §5, §9 "global browse flag" — never stored in a Connection
/// Record; browsing happens across devices sequentially).
struct BrowseState {
    running: bool,
}

pub struct Browser {
    state: Mutex<BrowseState>,
    progress_id: AtomicU64,
}

impl Default for Browser {
    fn default() -> Self {
        Self::new()
    }
}

impl Browser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrowseState { running: false }),
            progress_id: AtomicU64::new(0),
        }
    }

    /// `browse(session)` (spec.md §4.4). Concurrent triggers while one
    /// browse is running are silently dropped: they observe `None` here and
    /// the caller should simply not start a second descent.
    pub async fn try_acquire(&self) -> Option<u64> {
        let mut state = self.state.lock().await;
        if state.running {
            return None;
        }
        state.running = true;
        Some(self.progress_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn release(&self) {
        self.state.lock().await.running = false;
    }

    /// Runs one full recursive descent, emitting progress snapshots every
    /// 1000 ms via `progress`, and returns the flat discovered-tag list.
    /// Per-node browse/read failures are logged and the descent continues
    /// (spec.md §4.4 "Browse failures at any node log and continue").
    ///
    /// The engine is logically single-threaded at suspension points (spec.md
    /// §5), so the 1000 ms tick is paced inline against elapsed wall time
    /// rather than via a second concurrent task.
    pub async fn browse<T: OpcTransport + 'static>(
        self: &Arc<Self>,
        _manager: &Arc<ConnectionManager<T>>,
        transport: &T,
        session: SessionId,
        progress_id: u64,
        progress: &dyn ProgressSink,
    ) -> Vec<DiscoveredTag> {
        let counter = Arc::new(AtomicU64::new(0));
        let last_tick = Arc::new(Mutex::new(Instant::now()));

        let mut discovered = Vec::new();
        self.descend(
            transport,
            session,
            ROOT_FOLDER,
            "",
            &counter,
            &last_tick,
            &mut discovered,
            progress_id,
            progress,
        )
        .await;

        self.release().await;

        progress.emit(ProgressFrame {
            progress_txt: format!("Tag browsing in progress: {}", counter.load(Ordering::SeqCst)),
            progress_id,
            done: true,
        });

        discovered
    }

    #[allow(clippy::too_many_arguments)]
    async fn descend<T: OpcTransport>(
        &self,
        transport: &T,
        session: SessionId,
        node_id: &str,
        path_prefix: &str,
        counter: &Arc<AtomicU64>,
        last_tick: &Arc<Mutex<Instant>>,
        out: &mut Vec<DiscoveredTag>,
        progress_id: u64,
        progress: &dyn ProgressSink,
    ) {
        let children = match transport.browse_children(session, node_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(node_id, error = %e, "browse failed, continuing");
                return;
            }
        };

        for child in children {
            let path = if path_prefix.is_empty() {
                child.display_name.clone()
            } else {
                format!("{path_prefix}/{}", child.display_name)
            };

            if matches!(child.node_class, NodeClass::Variable | NodeClass::Object) {
                if let Some(value) = &child.value {
                    self.emit_value_entries(&path, &child.node_id, child.data_type_code, value, counter, out);
                }
            }

            self.maybe_tick(counter, last_tick, progress_id, progress).await;

            // Recurse regardless of node class (spec.md §4.4: "Objects and
            // Variables may both have descendants worth exploring").
            Box::pin(self.descend(
                transport,
                session,
                &child.node_id,
                &path,
                counter,
                last_tick,
                out,
                progress_id,
                progress,
            ))
            .await;
        }
    }

    async fn maybe_tick(
        &self,
        counter: &Arc<AtomicU64>,
        last_tick: &Arc<Mutex<Instant>>,
        progress_id: u64,
        progress: &dyn ProgressSink,
    ) {
        let mut last = last_tick.lock().await;
        if last.elapsed() >= Duration::from_millis(1000) {
            *last = Instant::now();
            progress.emit(ProgressFrame {
                progress_txt: format!(
                    "Tag browsing in progress: {}",
                    counter.load(Ordering::SeqCst)
                ),
                progress_id,
                done: false,
            });
        }
    }

    fn emit_value_entries(
        &self,
        path: &str,
        node_id: &str,
        data_type_code: u32,
        value: &Variant,
        counter: &Arc<AtomicU64>,
        out: &mut Vec<DiscoveredTag>,
    ) {
        match value {
            Variant::Array(array) if array.values.len() > 0 => {
                for i in 0..array.values.len() {
                    out.push(DiscoveredTag {
                        name: format!("{path}/_value[{i}]"),
                        node_id: node_id.to_string(),
                        data_type_code,
                        array_index: i as i32,
                    });
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ => {
                out.push(DiscoveredTag {
                    name: format!("{path}/_value"),
                    node_id: node_id.to_string(),
                    data_type_code,
                    array_index: -1,
                });
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn data_type_code_to_tag_type(code: u32) -> TagType {
    match code {
        1 => TagType::Bool,
        2..=9 => TagType::Int,
        10 | 11 => TagType::Float,
        13 => TagType::Datetime,
        _ => TagType::String,
    }
}

/// Population policy (spec.md §4.4): merge discovered tags into
/// `device.tags`, reusing `tagUid`s by name match, allocating fresh ones for
/// new discoveries, and dropping entries that were not rediscovered. Only
/// called after a *successful* browse (spec.md §9: a failed browse must
/// leave the prior tag set intact).
pub fn populate_device(device: &mut Device, discovered: Vec<DiscoveredTag>) {
    let mut by_name: HashMap<String, TagUid> = HashMap::new();
    for (uid, tag) in &device.tags {
        by_name.insert(tag.name.clone(), uid.clone());
    }

    let mut next_uid = device
        .tags
        .keys()
        .filter_map(|uid| uid.as_integer())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1);

    let mut consumed: std::collections::HashSet<TagUid> = std::collections::HashSet::new();
    let mut merged = TagMap::new();

    for found in discovered {
        let uid = match by_name.get(&found.name) {
            Some(existing_uid) => existing_uid.clone(),
            None => {
                let uid = TagUid::from(next_uid);
                next_uid += 1;
                uid
            }
        };
        consumed.insert(uid.clone());

        let existing = device.tags.get(&uid);
        let tag = Tag {
            name: found.name,
            tag_type: data_type_code_to_tag_type(found.data_type_code),
            read: existing.map(|t| t.read).unwrap_or(true),
            write: existing.map(|t| t.write).unwrap_or(true),
            node_id: found.node_id,
            node_type: found.data_type_code,
            array_index: found.array_index,
        };
        merged.insert(uid, tag);
    }

    debug!(
        kept = merged.len(),
        dropped = device.tags.len().saturating_sub(consumed.len()),
        "browse population merged"
    );

    device.tags = merged;
    device.browse_trigger = BrowseTrigger::Stop;
}
