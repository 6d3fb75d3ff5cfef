//! # Field-Mask Deriver
//!
//! Derives the ordered list of field paths present in a JSON request body,
//! used for partial-update (PATCH) semantics.
//!
//! ## How it works
//!
//! The body is never materialized into a JSON tree. A [`DeserializeSeed`]
//! visitor drives `serde_json`'s token stream directly, descending into
//! nested objects with the matching message descriptor in hand; memory is
//! bounded by nesting depth rather than body size. Leaves — scalars, and
//! messages the JSON mapping treats as leaf values, such as wrappers and
//! `Timestamp` — emit their dotted path in canonical (proto) field names.
//! Repeated and map fields contribute their containing path only and their
//! contents are skipped wholesale.
//!
//! Output preserves document order, and repeated keys (legal in lenient
//! JSON) are reported as duplicates rather than deduplicated.

use prost_reflect::{Kind, MessageDescriptor};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::fmt;

/// Errors raised while deriving a mask.
#[derive(Debug, thiserror::Error)]
pub enum FieldMaskError {
    /// The body is not valid JSON, or names a field the schema lacks.
    #[error("invalid partial-update body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message types whose JSON form is a leaf value rather than an object to
/// recurse into.
fn is_leaf_message(desc: &MessageDescriptor) -> bool {
    matches!(
        desc.full_name(),
        "google.protobuf.Timestamp"
            | "google.protobuf.Duration"
            | "google.protobuf.FieldMask"
            | "google.protobuf.Struct"
            | "google.protobuf.Value"
            | "google.protobuf.ListValue"
            | "google.protobuf.DoubleValue"
            | "google.protobuf.FloatValue"
            | "google.protobuf.Int64Value"
            | "google.protobuf.UInt64Value"
            | "google.protobuf.Int32Value"
            | "google.protobuf.UInt32Value"
            | "google.protobuf.BoolValue"
            | "google.protobuf.StringValue"
            | "google.protobuf.BytesValue"
            | "google.protobuf.Any"
    )
}

/// Derives the ordered set of leaf field paths present in `body`.
///
/// An empty body yields an empty mask; what an empty mask means (full
/// replacement vs no-op) is the caller's policy.
pub fn derive_field_mask(
    desc: &MessageDescriptor,
    body: &[u8],
) -> Result<Vec<String>, FieldMaskError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    MaskSeed {
        desc: desc.clone(),
        prefix: String::new(),
        paths: &mut paths,
    }
    .deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(paths)
}

struct MaskSeed<'a> {
    desc: MessageDescriptor,
    prefix: String,
    paths: &'a mut Vec<String>,
}

impl<'de> DeserializeSeed<'de> for MaskSeed<'_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for MaskSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a JSON value matching '{}'", self.desc.full_name())
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            let fd = self
                .desc
                .get_field_by_name(&key)
                .or_else(|| self.desc.get_field_by_json_name(&key))
                .ok_or_else(|| {
                    de::Error::custom(format_args!(
                        "field '{key}' not found in message '{}'",
                        self.desc.full_name()
                    ))
                })?;

            let path = if self.prefix.is_empty() {
                fd.name().to_string()
            } else {
                format!("{}.{}", self.prefix, fd.name())
            };

            match fd.kind() {
                // Repeated and map fields contribute their containing path
                // only; their elements are skipped.
                _ if fd.is_list() || fd.is_map() => {
                    self.paths.push(path);
                    map.next_value::<IgnoredAny>()?;
                }
                Kind::Message(child) if !is_leaf_message(&child) => {
                    map.next_value_seed(MaskSeed {
                        desc: child,
                        prefix: path,
                        paths: &mut *self.paths,
                    })?;
                }
                _ => {
                    self.paths.push(path);
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }

    // A non-object at a message position is still a leaf occurrence (for
    // example an explicit null clearing a nested message).

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        self.emit_leaf();
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(())
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
        self.emit_leaf();
        Ok(())
    }
}

impl MaskSeed<'_> {
    fn emit_leaf(self) {
        if !self.prefix.is_empty() {
            self.paths.push(self.prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(body: &str) -> Vec<String> {
        derive_field_mask(&echo_service::echo_request(), body.as_bytes()).unwrap()
    }

    #[test]
    fn nested_and_repeated_fields() {
        // Nested leaves expand; the repeated field contributes its
        // containing path only, in document order.
        assert_eq!(
            mask(r#"{"nested":{"name":1},"items":[{"name":2}]}"#),
            vec!["nested.name", "items"]
        );
    }

    #[test]
    fn canonical_names_not_aliases() {
        assert_eq!(mask(r#"{"int64Value":"1"}"#), vec!["int64_value"]);
        assert_eq!(mask(r#"{"int64_value":"1"}"#), vec!["int64_value"]);
    }

    #[test]
    fn document_order_preserved() {
        assert_eq!(
            mask(r#"{"message":"m","id":"i","nested":{"amount":1,"name":"n"}}"#),
            vec!["message", "id", "nested.amount", "nested.name"]
        );
    }

    #[test]
    fn well_known_types_are_leaves() {
        assert_eq!(
            mask(r#"{"startTime":"2023-01-01T00:00:00Z","optInt64":"5"}"#),
            vec!["start_time", "opt_int64"]
        );
    }

    #[test]
    fn maps_contribute_containing_path() {
        assert_eq!(mask(r#"{"labels":{"a":"1","b":"2"}}"#), vec!["labels"]);
    }

    #[test]
    fn null_nested_message_is_a_leaf() {
        assert_eq!(mask(r#"{"nested":null}"#), vec!["nested"]);
    }

    #[test]
    fn empty_and_scalar_bodies() {
        assert_eq!(mask(""), Vec::<String>::new());
        assert_eq!(mask("   "), Vec::<String>::new());
        assert_eq!(mask("{}"), Vec::<String>::new());
    }

    #[test]
    fn unknown_field_is_an_error() {
        let err = derive_field_mask(&echo_service::echo_request(), br#"{"nope":1}"#).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(derive_field_mask(&echo_service::echo_request(), b"{").is_err());
    }

    #[test]
    fn duplicate_keys_are_not_deduplicated() {
        assert_eq!(mask(r#"{"id":"a","id":"b"}"#), vec!["id", "id"]);
    }

    #[test]
    fn deep_nesting_recurses() {
        assert_eq!(
            mask(r#"{"nested":{"child":{"child":{"name":"x"}}}}"#),
            vec!["nested.child.child.name"]
        );
    }
}
