//! # Canonical JSON Marshaller
//!
//! Encodes and decodes the canonical protobuf↔JSON mapping through
//! `prost-reflect`'s serde support: 64-bit integers quote as strings,
//! enums render as names, `Timestamp`/`Duration`/`FieldMask` use their
//! fixed textual forms, wrappers unwrap to their inner scalar.
//!
//! Decoding is tolerant: either the JSON alias or the canonical field name
//! is accepted, and unknown fields are skipped. Streamed request bodies are
//! newline-delimited, one JSON value per line, decoded lazily.

use super::{ByteStream, DecodeError, EncodeError, Marshaler, MessageFrames, NewlineFramer, StreamFramer};
use bytes::Bytes;
use futures_util::StreamExt;
use prost_reflect::{
    DeserializeOptions, DynamicMessage, Kind, MessageDescriptor, ReflectMessage, SerializeOptions,
};
use std::sync::Arc;

/// Rendering switches for the canonical JSON form.
#[derive(Debug, Clone, Default)]
pub struct JsonOptions {
    /// Serialize fields under their declared (proto) names instead of the
    /// JSON aliases.
    pub use_proto_names: bool,
    /// Render enum values as integers instead of names.
    pub enums_as_numbers: bool,
    /// Emit unpopulated fields with their default values.
    pub emit_unpopulated: bool,
}

/// The canonical JSON marshaller.
pub struct JsonMarshaler {
    options: JsonOptions,
    serialize: SerializeOptions,
    deserialize: DeserializeOptions,
    framer: Arc<dyn StreamFramer>,
}

impl Default for JsonMarshaler {
    fn default() -> Self {
        Self::new(JsonOptions::default())
    }
}

impl JsonMarshaler {
    pub fn new(options: JsonOptions) -> Self {
        let serialize = SerializeOptions::new()
            .use_proto_field_name(options.use_proto_names)
            .use_enum_numbers(options.enums_as_numbers)
            .skip_default_fields(!options.emit_unpopulated)
            .stringify_64_bit_integers(true);
        let deserialize = DeserializeOptions::new().deny_unknown_fields(false);
        Self {
            options,
            serialize,
            deserialize,
            framer: Arc::new(NewlineFramer),
        }
    }

    /// Replaces the stream framer (newline-delimited by default).
    pub fn with_framer(mut self, framer: Arc<dyn StreamFramer>) -> Self {
        self.framer = framer;
        self
    }

    fn to_json_value(&self, msg: &DynamicMessage) -> Result<serde_json::Value, EncodeError> {
        Ok(msg.serialize_with_options(serde_json::value::Serializer, &self.serialize)?)
    }
}

impl Marshaler for JsonMarshaler {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn decode(&self, buf: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage, DecodeError> {
        if buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(DynamicMessage::new(desc));
        }
        let mut deserializer = serde_json::Deserializer::from_slice(buf);
        let msg =
            DynamicMessage::deserialize_with_options(desc, &mut deserializer, &self.deserialize)?;
        deserializer.end()?;
        Ok(msg)
    }

    fn encode(&self, msg: &DynamicMessage) -> Result<Bytes, EncodeError> {
        let mut buf = Vec::with_capacity(128);
        let mut serializer = serde_json::Serializer::new(&mut buf);
        msg.serialize_with_options(&mut serializer, &self.serialize)?;
        Ok(buf.into())
    }

    fn encode_field(&self, msg: &DynamicMessage, path: &str) -> Result<Bytes, EncodeError> {
        let mut value = self.to_json_value(msg)?;
        let mut desc = msg.descriptor();
        for segment in path.split('.') {
            let fd = desc
                .get_field_by_name(segment)
                .or_else(|| desc.get_field_by_json_name(segment))
                .ok_or_else(|| EncodeError::FieldNotFound {
                    path: path.to_string(),
                    message: desc.full_name().to_string(),
                })?;
            let key = if self.options.use_proto_names {
                fd.name().to_string()
            } else {
                fd.json_name().to_string()
            };
            value = match value {
                serde_json::Value::Object(mut map) => {
                    map.remove(&key).unwrap_or_else(|| default_json(&fd))
                }
                // The parent was unpopulated; synthesize the leaf default.
                _ => default_json(&fd),
            };
            if let Kind::Message(child) = fd.kind() {
                desc = child;
            }
        }
        Ok(serde_json::to_vec(&value)?.into())
    }

    fn stream_decoder(&self, body: ByteStream, desc: MessageDescriptor) -> MessageFrames {
        struct State {
            body: ByteStream,
            buf: Vec<u8>,
            eof: bool,
        }

        let options = self.deserialize.clone();
        let state = State {
            body,
            buf: Vec::new(),
            eof: false,
        };

        futures_util::stream::unfold(state, move |mut state| {
            let desc = desc.clone();
            let options = options.clone();
            async move {
                loop {
                    if let Some(pos) = state.buf.iter().position(|&b| b == b'\n') {
                        let mut line: Vec<u8> = state.buf.drain(..=pos).collect();
                        line.pop();
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        return Some((decode_frame(&line, desc, &options), state));
                    }
                    if state.eof {
                        let line = std::mem::take(&mut state.buf);
                        if line.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        return Some((decode_frame(&line, desc, &options), state));
                    }
                    match state.body.next().await {
                        Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            state.eof = true;
                            state.buf.clear();
                            return Some((Err(DecodeError::Read(err)), state));
                        }
                        None => state.eof = true,
                    }
                }
            }
        })
        .boxed()
    }

    fn framer(&self) -> Arc<dyn StreamFramer> {
        self.framer.clone()
    }
}

fn decode_frame(
    line: &[u8],
    desc: MessageDescriptor,
    options: &DeserializeOptions,
) -> Result<DynamicMessage, DecodeError> {
    let mut deserializer = serde_json::Deserializer::from_slice(line);
    let msg = DynamicMessage::deserialize_with_options(desc, &mut deserializer, options)?;
    deserializer.end()?;
    Ok(msg)
}

/// The canonical JSON default for an unpopulated field.
fn default_json(fd: &prost_reflect::FieldDescriptor) -> serde_json::Value {
    use serde_json::Value;
    if fd.is_list() {
        return Value::Array(Vec::new());
    }
    if fd.is_map() {
        return Value::Object(serde_json::Map::new());
    }
    match fd.kind() {
        Kind::Bool => Value::Bool(false),
        Kind::String => Value::String(String::new()),
        Kind::Bytes => Value::String(String::new()),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 | Kind::Uint64 | Kind::Fixed64 => {
            Value::String("0".to_string())
        }
        Kind::Double | Kind::Float | Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Uint32
        | Kind::Fixed32 => Value::Number(0.into()),
        Kind::Enum(_) | Kind::Message(_) => Value::Null,
    }
}
