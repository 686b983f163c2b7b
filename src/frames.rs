//! Wire-compatible frame shapes (spec.md §6).
//!
//! These are `Serialize`-only: the crate never owns the supervisor's TCP
//! socket or its line-delimited JSON framing, but a host's dispatcher can
//! serialize these directly onto it.

use std::collections::HashMap;

use serde::Serialize;

use crate::coercion::TagValue;

impl Serialize for TagValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TagValue::Null => serializer.serialize_none(),
            TagValue::Bool(b) => serializer.serialize_i32(if *b { 1 } else { 0 }),
            TagValue::Number(n) => serializer.serialize_f64(*n),
            TagValue::String(s) => serializer.serialize_str(s),
        }
    }
}

/// A per-tag read result: the projected value, `null`, or an error token
/// (spec.md §4.3, §6 `getTagsValues`).
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReadResult {
    Value(TagValue),
    Error {
        #[serde(rename = "errorTxt")]
        error_txt: String,
    },
}

/// `getTagsValues` response (spec.md §6).
#[derive(Debug, Serialize)]
pub struct TagsValuesResponse {
    pub cmd: &'static str,
    #[serde(rename = "transID")]
    pub trans_id: u64,
    pub values: Vec<ReadResult>,
}

/// `setTagsValues` response on success (spec.md §6).
#[derive(Debug, Serialize)]
pub struct SetTagsValuesResponse {
    pub cmd: &'static str,
    #[serde(rename = "transID")]
    pub trans_id: u64,
}

/// `pingDevice` response (spec.md §6).
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub active: bool,
}

/// One asynchronous change notification frame, grouped by device (spec.md
/// §6, §9, emitted by the Batcher).
#[derive(Debug, Serialize)]
pub struct AsyncTagsValuesFrame {
    pub cmd: &'static str,
    #[serde(rename = "transID")]
    pub trans_id: u64,
    #[serde(rename = "deviceUid")]
    pub device_uid: String,
    pub values: HashMap<String, TagValue>,
}

/// Browse progress frame (spec.md §4.4, §6).
#[derive(Debug, Serialize)]
pub struct ProgressFrameWire {
    #[serde(rename = "progressTxt")]
    pub progress_txt: String,
    #[serde(rename = "progressId")]
    pub progress_id: u64,
    pub done: bool,
}

impl From<crate::browser::ProgressFrame> for ProgressFrameWire {
    fn from(f: crate::browser::ProgressFrame) -> Self {
        Self {
            progress_txt: f.progress_txt,
            progress_id: f.progress_id,
            done: f.done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_value_serializes_null_as_json_null() {
        let v = serde_json::to_string(&TagValue::Null).unwrap();
        assert_eq!(v, "null");
    }

    #[test]
    fn read_result_error_serializes_with_error_txt_key() {
        let r = ReadResult::Error {
            error_txt: "TagNotFound".to_string(),
        };
        let v = serde_json::to_string(&r).unwrap();
        assert_eq!(v, r#"{"errorTxt":"TagNotFound"}"#);
    }
}
