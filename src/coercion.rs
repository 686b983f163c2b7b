//! Type Coercion (TC) — pure functions mapping OPC UA data types to and from
//! supervisor tag types (spec.md §4.6).

use chrono::{DateTime as ChronoDateTime, NaiveDateTime, Utc};
use opcua::types::{Array, DateTime as OpcDateTime, Variant};

use crate::model::{Tag, TagType};

/// A projected value as seen by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// Divisor `0x5af3107a4000` == 10^14, used to split a 64-bit integer into
/// two decimal limbs (spec.md §4.6).
const LIMB_DIVISOR: u128 = 100_000_000_000_000;

/// Render a signed 64-bit integer as a decimal string via the two-limb
/// algorithm the supervisor protocol expects, rather than via a native
/// formatter, so the wire representation matches byte-for-byte (spec.md
/// §4.6, §8 "64-bit round-trip").
pub fn int64_to_decimal_string(v: i64) -> String {
    if v < 0 {
        let magnitude = (v as i128).unsigned_abs();
        format!("-{}", u128_to_two_limb_decimal(magnitude))
    } else {
        u128_to_two_limb_decimal(v as u128)
    }
}

pub fn uint64_to_decimal_string(v: u64) -> String {
    u128_to_two_limb_decimal(v as u128)
}

fn u128_to_two_limb_decimal(v: u128) -> String {
    let hi = v / LIMB_DIVISOR;
    let lo = v % LIMB_DIVISOR;
    if hi == 0 {
        lo.to_string()
    } else {
        format!("{}{:014}", hi, lo)
    }
}

/// `getValueByIndex(tag, raw)` (spec.md §4.6).
pub fn get_value_by_index(tag: &Tag, raw: Option<&Variant>) -> TagValue {
    let raw = match raw {
        None | Some(Variant::Empty) => return TagValue::Null,
        Some(v) => v,
    };

    if tag.array_index < 0 {
        return get_value_by_type(tag, raw);
    }

    match raw {
        Variant::Array(array) => {
            let idx = tag.array_index as usize;
            match array.values.get(idx) {
                Some(element) => get_value_by_type(tag, element),
                None => TagValue::Null,
            }
        }
        _ => TagValue::Null,
    }
}

/// `getValueByType(tag, v)` (spec.md §4.6). `v` must not be the sentinel for
/// "no value" — callers route through [`get_value_by_index`] for that.
pub fn get_value_by_type(tag: &Tag, v: &Variant) -> TagValue {
    match tag.tag_type {
        TagType::Datetime => match v {
            Variant::DateTime(dt) => TagValue::Number(opc_datetime_to_epoch_millis(dt) as f64),
            other => TagValue::Number(variant_to_f64(other).unwrap_or(0.0)),
        },
        TagType::Bool => TagValue::Bool(variant_truthy(v)),
        TagType::String => {
            let s = variant_to_display_string(v);
            TagValue::String(truncate_chars(&s, 16))
        }
        TagType::Int | TagType::Float => match v {
            Variant::Int64(n) => TagValue::String(int64_to_decimal_string(*n)),
            Variant::UInt64(n) => TagValue::String(uint64_to_decimal_string(*n)),
            other => match variant_to_f64(other) {
                Some(n) => TagValue::Number(n),
                None => TagValue::String(variant_to_display_string(other)),
            },
        },
    }
}

fn variant_to_f64(v: &Variant) -> Option<f64> {
    match v {
        Variant::SByte(n) => Some(*n as f64),
        Variant::Byte(n) => Some(*n as f64),
        Variant::Int16(n) => Some(*n as f64),
        Variant::UInt16(n) => Some(*n as f64),
        Variant::Int32(n) => Some(*n as f64),
        Variant::UInt32(n) => Some(*n as f64),
        Variant::Int64(n) => Some(*n as f64),
        Variant::UInt64(n) => Some(*n as f64),
        Variant::Float(n) => Some(*n as f64),
        Variant::Double(n) => Some(*n),
        Variant::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn variant_truthy(v: &Variant) -> bool {
    match v {
        Variant::Boolean(b) => *b,
        other => variant_to_f64(other).map(|n| n != 0.0).unwrap_or(true),
    }
}

fn variant_to_display_string(v: &Variant) -> String {
    match v {
        Variant::String(s) => s.value.clone().unwrap_or_default(),
        Variant::Boolean(b) => b.to_string(),
        Variant::SByte(n) => n.to_string(),
        Variant::Byte(n) => n.to_string(),
        Variant::Int16(n) => n.to_string(),
        Variant::UInt16(n) => n.to_string(),
        Variant::Int32(n) => n.to_string(),
        Variant::UInt32(n) => n.to_string(),
        Variant::Int64(n) => int64_to_decimal_string(*n),
        Variant::UInt64(n) => uint64_to_decimal_string(*n),
        Variant::Float(n) => n.to_string(),
        Variant::Double(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn opc_datetime_to_epoch_millis(dt: &OpcDateTime) -> i64 {
    dt.as_chrono().timestamp_millis()
}

/// `getSetValue` (spec.md §4.6): project a supervisor write value into the
/// OPC UA variant matching the tag's declared scalar type. Array-indexed
/// writes are assembled by the caller (Request Engine) from the prior
/// `originalValue`, not here.
pub fn get_set_value(tag: &Tag, set_value: &TagValue) -> Result<Variant, String> {
    match tag.tag_type {
        TagType::Datetime => {
            let text = match set_value {
                TagValue::String(s) => s.clone(),
                other => return Err(format!("datetime write expects a string, got {other:?}")),
            };
            let naive = NaiveDateTime::parse_from_str(&text, "%d.%m.%Y %H:%M:%S")
                .map_err(|e| format!("invalid datetime {text:?}: {e}"))?;
            let utc: ChronoDateTime<Utc> = ChronoDateTime::from_naive_utc_and_offset(naive, Utc);
            Ok(Variant::DateTime(Box::new(OpcDateTime::from(utc))))
        }
        TagType::Bool => {
            let b = match set_value {
                TagValue::Bool(b) => *b,
                TagValue::Number(n) => *n != 0.0,
                TagValue::String(s) => !s.is_empty() && s != "0" && s != "false",
                TagValue::Null => false,
            };
            Ok(Variant::Boolean(b))
        }
        TagType::Int | TagType::Float => match set_value {
            TagValue::Number(n) => Ok(scalar_variant_for_node_type(tag, *n)),
            TagValue::String(s) => {
                let n: f64 = s
                    .parse()
                    .map_err(|_| format!("cannot coerce {s:?} to a number"))?;
                Ok(scalar_variant_for_node_type(tag, n))
            }
            TagValue::Bool(b) => Ok(scalar_variant_for_node_type(tag, if *b { 1.0 } else { 0.0 })),
            TagValue::Null => Err("cannot write null to a numeric tag".to_string()),
        },
        TagType::String => {
            let s = match set_value {
                TagValue::String(s) => s.clone(),
                TagValue::Number(n) => n.to_string(),
                TagValue::Bool(b) => b.to_string(),
                TagValue::Null => String::new(),
            };
            Ok(Variant::from(s))
        }
    }
}

/// Picks the OPC UA scalar representation matching the tag's declared
/// `nodeType` (the numeric DataType code already stored on the Tag), falling
/// back to `Double` when the code is unrecognized.
fn scalar_variant_for_node_type(tag: &Tag, n: f64) -> Variant {
    match tag.node_type {
        1 => Variant::Boolean(n != 0.0),
        2 => Variant::SByte(n as i8),
        3 => Variant::Byte(n as u8),
        4 => Variant::Int16(n as i16),
        5 => Variant::UInt16(n as u16),
        6 => Variant::Int32(n as i32),
        7 => Variant::UInt32(n as u32),
        8 => Variant::Int64(n as i64),
        9 => Variant::UInt64(n as u64),
        10 => Variant::Float(n as f32),
        11 => Variant::Double(n),
        _ => Variant::Double(n),
    }
}

/// Replace `array_index` in a copy of `original` and return the whole array,
/// for array-element writes (spec.md §4.3, §4.6).
pub fn splice_array_element(
    original: &Variant,
    array_index: usize,
    new_element: Variant,
) -> Result<Variant, String> {
    match original {
        Variant::Array(array) => {
            let mut values = array.values.clone();
            let slot = values
                .get_mut(array_index)
                .ok_or_else(|| format!("array index {array_index} out of range"))?;
            *slot = new_element;
            let value_type = array.value_type;
            Array::new(value_type, values)
                .map(|a| Variant::Array(Box::new(a)))
                .map_err(|e| e.to_string())
        }
        _ => Err("originalValue is not array-typed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int64_limb_split_matches_spec_divisor() {
        assert_eq!(int64_to_decimal_string(0), "0");
        assert_eq!(int64_to_decimal_string(123), "123");
        assert_eq!(int64_to_decimal_string(-123), "-123");
        assert_eq!(int64_to_decimal_string(i64::MAX), i64::MAX.to_string());
        assert_eq!(int64_to_decimal_string(i64::MIN), i64::MIN.to_string());
    }

    #[test]
    fn uint64_limb_split_matches_arbitrary_precision() {
        assert_eq!(uint64_to_decimal_string(u64::MAX), u64::MAX.to_string());
        assert_eq!(uint64_to_decimal_string(100_000_000_000_000), "100000000000000");
    }

    fn float_tag(array_index: i32) -> Tag {
        Tag {
            name: "temp".to_string(),
            tag_type: TagType::Float,
            read: true,
            write: true,
            node_id: "ns=2;s=Temp".to_string(),
            node_type: 11,
            array_index,
        }
    }

    #[test]
    fn scalar_projection_returns_null_for_missing_value() {
        let tag = float_tag(-1);
        assert_eq!(get_value_by_index(&tag, None), TagValue::Null);
    }

    #[test]
    fn array_projection_picks_element_in_range() {
        let tag = float_tag(1);
        let raw = Variant::from(vec![1.0f64, 2.0, 3.0]);
        assert_eq!(get_value_by_index(&tag, Some(&raw)), TagValue::Number(2.0));
    }

    #[test]
    fn array_projection_out_of_range_is_null() {
        let tag = float_tag(5);
        let raw = Variant::from(vec![1.0f64, 2.0]);
        assert_eq!(get_value_by_index(&tag, Some(&raw)), TagValue::Null);
    }

    #[test]
    fn string_projection_truncates_to_16_chars() {
        let mut tag = float_tag(-1);
        tag.tag_type = TagType::String;
        let raw = Variant::from("this string is definitely longer than sixteen characters");
        match get_value_by_index(&tag, Some(&raw)) {
            TagValue::String(s) => assert_eq!(s.chars().count(), 16),
            other => panic!("expected string, got {other:?}"),
        }
    }
}
