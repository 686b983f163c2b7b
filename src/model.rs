//! Configuration data model (spec.md §3).
//!
//! `Device` and `Tag` are the shapes the host's configuration object
//! exposes. The engine observes them read-only except for the two
//! documented mutations the Browser performs (see `config_view.rs`).

use std::fmt;

/// Supervisor-facing tag value types (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagType {
    Bool,
    Int,
    Float,
    String,
    Datetime,
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TagType::Bool => "bool",
            TagType::Int => "int",
            TagType::Float => "float",
            TagType::String => "string",
            TagType::Datetime => "datetime",
        };
        write!(f, "{s}")
    }
}

/// A device's browse trigger, toggled by the host and reset by the engine
/// after a browse completes (spec.md §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseTrigger {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum SecurityPolicy {
    None,
    Basic128,
    Basic128Rsa15,
    Basic192,
    Basic192Rsa15,
    Basic256,
    Basic256Rsa15,
    Basic256Sha256,
    Aes128_Sha256_RsaOaep,
    Aes256_Sha256_RsaPss,
}

/// Per-device security configuration (spec.md §3, §4.1).
#[derive(Debug, Clone)]
pub struct SecurityOptions {
    pub security_mode: SecurityMode,
    pub security_policy: SecurityPolicy,
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub anonymous: bool,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::None,
            security_policy: SecurityPolicy::None,
            certificate_file: None,
            private_key_file: None,
            anonymous: true,
            user_name: None,
            password: None,
        }
    }
}

/// A tag's stable identifier within a device (spec.md §3). Compared as a
/// string everywhere except the Browser's population logic, which treats it
/// as an integer counter to mint fresh uids for newly discovered tags.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagUid(pub String);

impl TagUid {
    pub fn as_integer(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u64> for TagUid {
    fn from(n: u64) -> Self {
        TagUid(n.to_string())
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered-by-insertion mapping of `tagUid -> Tag` (spec.md §3). A `BTreeMap`
/// would sort by `TagUid`'s string value, which silently reorders tags once
/// a device has ten or more of them ("10" sorts before "2") and breaks
/// `first_tag()`'s "first tag listed" semantics; this keeps entries in the
/// order they were inserted instead.
#[derive(Debug, Clone, Default)]
pub struct TagMap {
    entries: Vec<(TagUid, Tag)>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: TagUid, tag: Tag) {
        match self.entries.iter_mut().find(|(u, _)| *u == uid) {
            Some(slot) => slot.1 = tag,
            None => self.entries.push((uid, tag)),
        }
    }

    pub fn get(&self, uid: &TagUid) -> Option<&Tag> {
        self.entries.iter().find(|(u, _)| u == uid).map(|(_, t)| t)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TagUid> {
        self.entries.iter().map(|(u, _)| u)
    }

    pub fn values(&self) -> impl Iterator<Item = &Tag> {
        self.entries.iter().map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a TagMap {
    type Item = (&'a TagUid, &'a Tag);
    type IntoIter = std::iter::Map<std::slice::Iter<'a, (TagUid, Tag)>, fn(&'a (TagUid, Tag)) -> (&'a TagUid, &'a Tag)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(u, t)| (u, t))
    }
}

/// A device entry in the host's configuration object (spec.md §3).
#[derive(Debug, Clone)]
pub struct Device {
    pub device_uid: String,
    pub endpoint_url: String,
    pub security: SecurityOptions,
    pub timeout: std::time::Duration,
    pub browse_trigger: BrowseTrigger,
    pub tags: TagMap,
}

impl Device {
    /// The first tag listed for the device, used as the seed tag for a
    /// background `ensureConnection` triggered by `status` (spec.md §4.3).
    pub fn first_tag(&self) -> Option<&Tag> {
        self.tags.values().next()
    }

    pub fn tag_by_name(&self, name: &str) -> Option<&Tag> {
        self.tags.values().find(|t| t.name == name)
    }
}

/// A tag entry in the host's configuration object (spec.md §3).
///
/// `array_index` of `-1` means scalar; invariant: when `array_index >= 0`
/// the underlying OPC UA variable must be array-typed.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub tag_type: TagType,
    pub read: bool,
    pub write: bool,
    pub node_id: String,
    pub node_type: u32,
    pub array_index: i32,
}

impl Tag {
    pub fn is_array_element(&self) -> bool {
        self.array_index >= 0
    }
}
