//! # Field-Path Resolver
//!
//! Resolves dotted field paths (`nested.child.name`) against a message
//! schema and writes text values — URL variables and query parameters —
//! into a [`DynamicMessage`] with the scalar coercion rules of the
//! transcoding wire format.
//!
//! ## How it works
//!
//! Setting a value runs in three phases so a failure can never leave the
//! message half-written:
//!
//! 1. resolve the descriptor chain for the path (no mutation),
//! 2. coerce every text value into a typed [`Value`],
//! 3. walk down the message, creating intermediate messages on first
//!    write, and set (or append to) the leaf field.
//!
//! Path segments accept the declared field name, its JSON alias, or the
//! lower-snake-case equivalent of the alias, in that order. Traversal
//! through repeated or map fields is rejected, and intermediate messages
//! are only instantiated when a write actually happens, which keeps
//! self-referential schemas cheap.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, Value,
};
use std::borrow::Cow;

/// Errors raised while resolving a field path or coercing a value.
#[derive(Debug, thiserror::Error)]
pub enum FieldPathError {
    #[error("empty field path")]
    Empty,
    #[error("no value provided for field path '{0}'")]
    NoValues(String),
    #[error("field '{segment}' not found in message '{message}'")]
    NotFound { segment: String, message: String },
    #[error("field path '{0}' traverses a repeated or map field")]
    Traversal(String),
    #[error("map field '{0}' cannot be populated from a parameter")]
    MapUnsupported(String),
    #[error("too many values for field '{0}'")]
    TooManyValues(String),
    #[error("oneof '{0}' already has a field set")]
    OneofConflict(String),
    #[error("invalid value '{value}' for field path '{path}': {reason}")]
    Coercion {
        path: String,
        value: String,
        reason: String,
    },
}

/// A resolved path: the chain of message-typed parents and the leaf field.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    parents: Vec<FieldDescriptor>,
    leaf: FieldDescriptor,
}

impl ResolvedPath {
    /// The leaf field the path designates.
    pub fn leaf(&self) -> &FieldDescriptor {
        &self.leaf
    }
}

/// Resolves a dotted path against a schema without touching any message.
pub fn resolve_path(desc: &MessageDescriptor, path: &str) -> Result<ResolvedPath, FieldPathError> {
    if path.is_empty() {
        return Err(FieldPathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut parents = Vec::with_capacity(segments.len() - 1);
    let mut current = desc.clone();

    for (i, segment) in segments.iter().enumerate() {
        let fd = resolve_field(&current, segment).ok_or_else(|| FieldPathError::NotFound {
            segment: (*segment).to_string(),
            message: current.full_name().to_string(),
        })?;
        if i + 1 == segments.len() {
            return Ok(ResolvedPath { parents, leaf: fd });
        }
        if fd.is_list() || fd.is_map() {
            return Err(FieldPathError::Traversal(path.to_string()));
        }
        current = match fd.kind() {
            Kind::Message(next) => next,
            _ => return Err(FieldPathError::Traversal(path.to_string())),
        };
        parents.push(fd);
    }
    Err(FieldPathError::Empty)
}

/// Resolves one path segment against a message: declared name first, then
/// JSON alias, then the lower-snake-case equivalent.
fn resolve_field(desc: &MessageDescriptor, segment: &str) -> Option<FieldDescriptor> {
    desc.get_field_by_name(segment)
        .or_else(|| desc.get_field_by_json_name(segment))
        .or_else(|| desc.get_field_by_name(&to_snake_case(segment)))
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Coerces text values and writes them at `path` inside `msg`.
///
/// A list of values writes a repeated field in order; a single value on a
/// repeated field appends one element. On any error the message is left
/// unchanged.
pub fn set_field_by_path(
    msg: &mut DynamicMessage,
    path: &str,
    values: &[&str],
) -> Result<(), FieldPathError> {
    let resolved = resolve_path(&msg.descriptor(), path)?;
    if values.is_empty() {
        return Err(FieldPathError::NoValues(path.to_string()));
    }

    let mut coerced = Vec::with_capacity(values.len());
    for value in values {
        coerced.push(coerce(&resolved.leaf, value).map_err(|reason| {
            FieldPathError::Coercion {
                path: path.to_string(),
                value: (*value).to_string(),
                reason,
            }
        })?);
    }

    if resolved.leaf.is_map() {
        return Err(FieldPathError::MapUnsupported(path.to_string()));
    }
    if !resolved.leaf.is_list() && coerced.len() > 1 {
        return Err(FieldPathError::TooManyValues(path.to_string()));
    }

    check_oneof(msg, &resolved)?;

    let current = descend(msg, &resolved.parents);

    if resolved.leaf.is_list() {
        match current.get_field_mut(&resolved.leaf) {
            Value::List(list) => list.extend(coerced),
            slot => *slot = Value::List(coerced),
        }
    } else {
        let value = coerced.into_iter().next().ok_or_else(|| {
            FieldPathError::NoValues(path.to_string())
        })?;
        current.set_field(&resolved.leaf, value);
    }
    Ok(())
}

/// Writes an already-typed value at `path`, creating intermediate messages
/// on first write. Used by the dispatcher to land a decoded body message in
/// its bound subfield.
pub fn set_value_by_path(
    msg: &mut DynamicMessage,
    path: &str,
    value: Value,
) -> Result<(), FieldPathError> {
    let resolved = resolve_path(&msg.descriptor(), path)?;
    if resolved.leaf.is_map() {
        return Err(FieldPathError::MapUnsupported(path.to_string()));
    }
    check_oneof(msg, &resolved)?;
    let current = descend(msg, &resolved.parents);
    current.set_field(&resolved.leaf, value);
    Ok(())
}

/// Decoding into an already-claimed oneof is an error; the check runs
/// against the existing message state, before any parent is created.
fn check_oneof(msg: &DynamicMessage, resolved: &ResolvedPath) -> Result<(), FieldPathError> {
    let Some(oneof) = resolved.leaf.containing_oneof() else {
        return Ok(());
    };
    if let Some(parent) = existing_parent(msg, &resolved.parents) {
        for sibling in oneof.fields() {
            if sibling.number() != resolved.leaf.number() && parent.has_field(&sibling) {
                return Err(FieldPathError::OneofConflict(oneof.name().to_string()));
            }
        }
    }
    Ok(())
}

/// Walks down `parents`, creating intermediate messages as needed, and
/// returns the innermost message.
fn descend<'a>(
    msg: &'a mut DynamicMessage,
    parents: &[FieldDescriptor],
) -> &'a mut DynamicMessage {
    let Some((fd, rest)) = parents.split_first() else {
        return msg;
    };
    let slot = msg.get_field_mut(fd);
    if !matches!(slot, Value::Message(_)) {
        let child = match fd.kind() {
            Kind::Message(desc) => desc,
            _ => unreachable!("resolve_path only descends through messages"),
        };
        *slot = Value::Message(DynamicMessage::new(child));
    }
    match slot {
        Value::Message(m) => descend(m, rest),
        _ => unreachable!("slot was just set to a message"),
    }
}

/// Walks the existing message along `parents`, returning the innermost
/// message if every step is already present.
fn existing_parent<'a>(
    msg: &'a DynamicMessage,
    parents: &[FieldDescriptor],
) -> Option<&'a DynamicMessage> {
    match parents.split_first() {
        None => Some(msg),
        Some((fd, rest)) => {
            if !msg.has_field(fd) {
                return None;
            }
            match msg.get_field(fd) {
                Cow::Borrowed(Value::Message(m)) => existing_parent(m, rest),
                _ => None,
            }
        }
    }
}

/// Coerces one text value into the leaf field's type.
fn coerce(fd: &FieldDescriptor, text: &str) -> Result<Value, String> {
    match fd.kind() {
        Kind::Bool => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err("expected 'true' or 'false'".to_string()),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => text
            .parse::<i32>()
            .map(Value::I32)
            .map_err(|e| e.to_string()),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => text
            .parse::<i64>()
            .map(Value::I64)
            .map_err(|e| e.to_string()),
        Kind::Uint32 | Kind::Fixed32 => text
            .parse::<u32>()
            .map(Value::U32)
            .map_err(|e| e.to_string()),
        Kind::Uint64 | Kind::Fixed64 => text
            .parse::<u64>()
            .map(Value::U64)
            .map_err(|e| e.to_string()),
        Kind::Float => text
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|e| e.to_string()),
        Kind::Double => text
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|e| e.to_string()),
        Kind::String => Ok(Value::String(text.to_string())),
        Kind::Bytes => decode_base64(text).map(|b| Value::Bytes(b.into())),
        Kind::Enum(enum_desc) => {
            if let Some(v) = enum_desc.get_value_by_name(text) {
                return Ok(Value::EnumNumber(v.number()));
            }
            let number: i32 = text
                .parse()
                .map_err(|_| format!("'{text}' is not a value of enum '{}'", enum_desc.full_name()))?;
            match enum_desc.get_value(number) {
                Some(v) => Ok(Value::EnumNumber(v.number())),
                None => Err(format!(
                    "'{text}' is not a value of enum '{}'",
                    enum_desc.full_name()
                )),
            }
        }
        Kind::Message(desc) => coerce_message(&desc, text),
    }
}

/// Message-typed leaves accept only the well-known types, each parsed from
/// its canonical JSON text form.
fn coerce_message(desc: &MessageDescriptor, text: &str) -> Result<Value, String> {
    match desc.full_name() {
        "google.protobuf.Timestamp" | "google.protobuf.Duration" => {
            let json = serde_json::Value::String(text.to_string());
            DynamicMessage::deserialize(desc.clone(), json)
                .map(Value::Message)
                .map_err(|e| e.to_string())
        }
        "google.protobuf.DoubleValue"
        | "google.protobuf.FloatValue"
        | "google.protobuf.Int64Value"
        | "google.protobuf.UInt64Value"
        | "google.protobuf.Int32Value"
        | "google.protobuf.UInt32Value"
        | "google.protobuf.BoolValue"
        | "google.protobuf.StringValue"
        | "google.protobuf.BytesValue" => {
            let value_fd = desc
                .get_field_by_name("value")
                .ok_or_else(|| format!("malformed wrapper type '{}'", desc.full_name()))?;
            let inner = coerce(&value_fd, text)?;
            let mut wrapper = DynamicMessage::new(desc.clone());
            wrapper.set_field(&value_fd, inner);
            Ok(Value::Message(wrapper))
        }
        "google.protobuf.FieldMask" => {
            let paths_fd = desc
                .get_field_by_name("paths")
                .ok_or_else(|| format!("malformed mask type '{}'", desc.full_name()))?;
            let paths = text
                .split(',')
                .map(|p| Value::String(p.to_string()))
                .collect();
            let mut mask = DynamicMessage::new(desc.clone());
            mask.set_field(&paths_fd, Value::List(paths));
            Ok(Value::Message(mask))
        }
        "google.protobuf.Struct" | "google.protobuf.Value" | "google.protobuf.ListValue" => {
            let json: serde_json::Value =
                serde_json::from_str(text).map_err(|e| e.to_string())?;
            DynamicMessage::deserialize(desc.clone(), json)
                .map(Value::Message)
                .map_err(|e| e.to_string())
        }
        other => Err(format!("unsupported message type '{other}'")),
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>, String> {
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(text) {
            return Ok(decoded);
        }
    }
    Err("invalid base64 value".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DynamicMessage {
        DynamicMessage::new(echo_service::echo_request())
    }

    #[test]
    fn sets_top_level_string() {
        let mut msg = request();
        set_field_by_path(&mut msg, "id", &["myid"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&fd).as_str(), Some("myid"));
    }

    #[test]
    fn resolves_json_alias() {
        let mut msg = request();
        set_field_by_path(&mut msg, "int64Value", &["4294967296"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("int64_value").unwrap();
        assert_eq!(msg.get_field(&fd).as_i64(), Some(4294967296));
    }

    #[test]
    fn creates_nested_parents_on_write() {
        let mut msg = request();
        set_field_by_path(&mut msg, "nested.child.name", &["deep"]).unwrap();
        let nested_fd = msg.descriptor().get_field_by_name("nested").unwrap();
        let nested = msg.get_field(&nested_fd);
        let nested = nested.as_message().unwrap();
        let child_fd = nested.descriptor().get_field_by_name("child").unwrap();
        let child = nested.get_field(&child_fd);
        let child = child.as_message().unwrap();
        let name_fd = child.descriptor().get_field_by_name("name").unwrap();
        assert_eq!(child.get_field(&name_fd).as_str(), Some("deep"));
    }

    #[test]
    fn repeated_field_appends_in_order() {
        let mut msg = request();
        set_field_by_path(&mut msg, "tags", &["a", "b"]).unwrap();
        set_field_by_path(&mut msg, "tags", &["c"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("tags").unwrap();
        let tags: Vec<_> = msg
            .get_field(&fd)
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn traversal_through_repeated_is_rejected() {
        let mut msg = request();
        let err = set_field_by_path(&mut msg, "items.name", &["x"]).unwrap_err();
        assert!(matches!(err, FieldPathError::Traversal(_)));
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        let mut msg = request();
        // Beyond 64-bit bounds.
        let err = set_field_by_path(&mut msg, "int64_value", &["92233720368547758199"]).unwrap_err();
        assert!(matches!(err, FieldPathError::Coercion { .. }));
        // Negative into unsigned.
        let err = set_field_by_path(&mut msg, "uint64_value", &["-1"]).unwrap_err();
        assert!(matches!(err, FieldPathError::Coercion { .. }));
        // The message is untouched after failures.
        let fd = msg.descriptor().get_field_by_name("int64_value").unwrap();
        assert!(!msg.has_field(&fd));
    }

    #[test]
    fn float_accepts_special_tokens() {
        let mut msg = request();
        set_field_by_path(&mut msg, "double_value", &["Infinity"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("double_value").unwrap();
        assert_eq!(msg.get_field(&fd).as_f64(), Some(f64::INFINITY));

        set_field_by_path(&mut msg, "double_value", &["NaN"]).unwrap();
        assert!(msg.get_field(&fd).as_f64().unwrap().is_nan());
    }

    #[test]
    fn bool_is_strict() {
        let mut msg = request();
        assert!(set_field_by_path(&mut msg, "bool_value", &["1"]).is_err());
        set_field_by_path(&mut msg, "bool_value", &["true"]).unwrap();
    }

    #[test]
    fn enum_by_name_and_number() {
        let mut msg = request();
        set_field_by_path(&mut msg, "corner", &["CORNER_NE"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("corner").unwrap();
        assert_eq!(msg.get_field(&fd).as_enum_number(), Some(1));

        set_field_by_path(&mut msg, "corner", &["2"]).unwrap();
        assert_eq!(msg.get_field(&fd).as_enum_number(), Some(2));

        assert!(set_field_by_path(&mut msg, "corner", &["CORNER_NOPE"]).is_err());
        assert!(set_field_by_path(&mut msg, "corner", &["99"]).is_err());
    }

    #[test]
    fn bytes_accepts_url_safe_base64() {
        let mut msg = request();
        set_field_by_path(&mut msg, "bytes_value", &["aGVsbG8"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("bytes_value").unwrap();
        assert_eq!(msg.get_field(&fd).as_bytes().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn oneof_conflict_is_rejected() {
        let mut msg = request();
        set_field_by_path(&mut msg, "str_kind", &["abc"]).unwrap();
        let err = set_field_by_path(&mut msg, "int_kind", &["5"]).unwrap_err();
        assert!(matches!(err, FieldPathError::OneofConflict(_)));
    }

    #[test]
    fn timestamp_and_duration_parse_canonical_forms() {
        let mut msg = request();
        set_field_by_path(&mut msg, "start_time", &["2023-01-02T03:04:05Z"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("start_time").unwrap();
        let ts = msg.get_field(&fd);
        let ts = ts.as_message().unwrap();
        let seconds_fd = ts.descriptor().get_field_by_name("seconds").unwrap();
        assert_eq!(ts.get_field(&seconds_fd).as_i64(), Some(1672628645));

        set_field_by_path(&mut msg, "ttl", &["3.5s"]).unwrap();

        assert!(set_field_by_path(&mut msg, "start_time", &["not-a-time"]).is_err());
    }

    #[test]
    fn wrapper_types_take_their_inner_scalar() {
        let mut msg = request();
        set_field_by_path(&mut msg, "opt_int64", &["77"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("opt_int64").unwrap();
        let wrapper = msg.get_field(&fd);
        let wrapper = wrapper.as_message().unwrap();
        let value_fd = wrapper.descriptor().get_field_by_name("value").unwrap();
        assert_eq!(wrapper.get_field(&value_fd).as_i64(), Some(77));
    }

    #[test]
    fn field_mask_splits_on_comma() {
        let mut msg = request();
        set_field_by_path(&mut msg, "update_mask", &["a.b,c"]).unwrap();
        let fd = msg.descriptor().get_field_by_name("update_mask").unwrap();
        let mask = msg.get_field(&fd);
        let mask = mask.as_message().unwrap();
        let paths_fd = mask.descriptor().get_field_by_name("paths").unwrap();
        let paths: Vec<_> = mask
            .get_field(&paths_fd)
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["a.b", "c"]);
    }

    #[test]
    fn map_fields_are_not_settable() {
        let mut msg = request();
        let err = set_field_by_path(&mut msg, "labels", &["x"]).unwrap_err();
        assert!(matches!(err, FieldPathError::MapUnsupported(_)));
    }

    #[test]
    fn unknown_field_reports_message_name() {
        let mut msg = request();
        let err = set_field_by_path(&mut msg, "nope", &["x"]).unwrap_err();
        match err {
            FieldPathError::NotFound { segment, message } => {
                assert_eq!(segment, "nope");
                assert_eq!(message, "echo.EchoRequest");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
