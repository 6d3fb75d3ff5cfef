//! # Marshaller Registry
//!
//! Media-type negotiation for request decoding and response encoding. A
//! [`Marshaler`] turns bytes into [`DynamicMessage`]s and back; the
//! [`MarshalerRegistry`] maps MIME types to marshallers and resolves the
//! (inbound, outbound) pair for a request from its `Content-Type` and
//! `Accept` headers.
//!
//! Two marshallers ship with the crate: the canonical protobuf-JSON one
//! ([`json::JsonMarshaler`]) and the binary wire-format one
//! ([`proto::ProtoMarshaler`]). Stream responses are framed by a pluggable
//! [`StreamFramer`] — newline-delimited by default, SSE available.

pub mod json;
pub mod proto;

use crate::BoxError;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use http::header::{ACCEPT, CONTENT_TYPE};
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

/// The fallback MIME type used for requests which do not match a
/// registered MIME type.
pub const MIME_WILDCARD: &str = "*";

/// A stream of raw request-body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// A stream of decoded request messages, one per body frame.
pub type MessageFrames = BoxStream<'static, Result<DynamicMessage, DecodeError>>;

/// Errors raised while decoding a request body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed protobuf body: {0}")]
    Proto(#[from] prost::DecodeError),
    #[error("failed to read request body: {0}")]
    Read(#[source] BoxError),
}

/// Errors raised while encoding a response.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to encode response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response field path '{path}' cannot be encoded by the '{media_type}' marshaller")]
    UnsupportedField { path: String, media_type: String },
    #[error("response field path '{path}' not found in '{message}'")]
    FieldNotFound { path: String, message: String },
}

/// Bidirectional codec between HTTP bodies and dynamic messages.
pub trait Marshaler: Send + Sync {
    /// The media type written on responses.
    fn content_type(&self) -> &'static str;

    /// Decodes one complete body into a message.
    fn decode(&self, buf: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage, DecodeError>;

    /// Encodes one message.
    fn encode(&self, msg: &DynamicMessage) -> Result<Bytes, EncodeError>;

    /// Encodes only the value at `path` inside `msg`. Scalar fields are
    /// emitted bare, not wrapped in an object.
    fn encode_field(&self, msg: &DynamicMessage, path: &str) -> Result<Bytes, EncodeError>;

    /// Splits a request body stream into frames, decoding one message per
    /// frame lazily.
    fn stream_decoder(&self, body: ByteStream, desc: MessageDescriptor) -> MessageFrames;

    /// The framer used for streamed responses.
    fn framer(&self) -> Arc<dyn StreamFramer>;
}

/// Wraps each streamed response chunk in an outer framing.
pub trait StreamFramer: Send + Sync {
    /// Overrides the response content type for streams, when set.
    fn content_type(&self) -> Option<&'static str> {
        None
    }

    /// Frames one chunk.
    fn frame(&self, chunk: &[u8]) -> Bytes;
}

/// One JSON value per line.
#[derive(Debug, Default)]
pub struct NewlineFramer;

impl StreamFramer for NewlineFramer {
    fn frame(&self, chunk: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(chunk.len() + 1);
        out.extend_from_slice(chunk);
        out.push(b'\n');
        out.into()
    }
}

/// Server-sent-events framing: `data: <chunk>\n\n`.
#[derive(Debug, Default)]
pub struct SseFramer;

impl StreamFramer for SseFramer {
    fn content_type(&self) -> Option<&'static str> {
        Some("text/event-stream")
    }

    fn frame(&self, chunk: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(chunk.len() + 8);
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\n\n");
        out.into()
    }
}

/// A mapping from MIME types to marshallers, frozen before serving.
#[derive(Clone)]
pub struct MarshalerRegistry {
    mime_map: HashMap<String, Arc<dyn Marshaler>>,
    fallback: Arc<dyn Marshaler>,
}

impl Default for MarshalerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MarshalerRegistry {
    /// Builds the stock registry: canonical JSON under `application/json`
    /// and the wildcard, wire-format protobuf under
    /// `application/x-protobuf`.
    pub fn new() -> Self {
        let json: Arc<dyn Marshaler> = Arc::new(json::JsonMarshaler::default());
        let proto: Arc<dyn Marshaler> = Arc::new(proto::ProtoMarshaler::default());
        let mut mime_map: HashMap<String, Arc<dyn Marshaler>> = HashMap::new();
        mime_map.insert("application/json".to_string(), json.clone());
        mime_map.insert("application/x-protobuf".to_string(), proto);
        mime_map.insert(MIME_WILDCARD.to_string(), json.clone());
        Self {
            mime_map,
            fallback: json,
        }
    }

    /// Registers a marshaller for a case-sensitive MIME type string
    /// (`"*"` to match any media type).
    pub fn register(&mut self, mime: &str, marshaler: Arc<dyn Marshaler>) {
        if mime.is_empty() {
            return;
        }
        if mime == MIME_WILDCARD {
            self.fallback = marshaler.clone();
        }
        self.mime_map.insert(mime.to_string(), marshaler);
    }

    /// Resolves the (inbound, outbound) marshallers for a request.
    ///
    /// Inbound follows `Content-Type`, falling back to the wildcard.
    /// Outbound prefers `Accept`, then `Content-Type`, then the wildcard.
    /// The first registry hit wins when a header is repeated.
    pub fn for_request(&self, headers: &HeaderMap) -> (Arc<dyn Marshaler>, Arc<dyn Marshaler>) {
        let lookup = |values: http::header::GetAll<'_, http::HeaderValue>| {
            values
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(|v| self.mime_map.get(v).cloned())
        };

        let inbound = lookup(headers.get_all(CONTENT_TYPE)).unwrap_or_else(|| self.fallback.clone());
        let outbound = lookup(headers.get_all(ACCEPT))
            .or_else(|| lookup(headers.get_all(CONTENT_TYPE)))
            .unwrap_or_else(|| self.fallback.clone());
        (inbound, outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn content_type_selects_inbound() {
        let registry = MarshalerRegistry::new();
        let (inbound, _) = registry.for_request(&headers(&[("content-type", "application/x-protobuf")]));
        assert_eq!(inbound.content_type(), "application/x-protobuf");
    }

    #[test]
    fn accept_wins_for_outbound() {
        let registry = MarshalerRegistry::new();
        let (inbound, outbound) = registry.for_request(&headers(&[
            ("content-type", "application/x-protobuf"),
            ("accept", "application/json"),
        ]));
        assert_eq!(inbound.content_type(), "application/x-protobuf");
        assert_eq!(outbound.content_type(), "application/json");
    }

    #[test]
    fn unknown_types_fall_back_to_wildcard() {
        let registry = MarshalerRegistry::new();
        let (inbound, outbound) = registry.for_request(&headers(&[("content-type", "text/plain")]));
        assert_eq!(inbound.content_type(), "application/json");
        assert_eq!(outbound.content_type(), "application/json");
    }

    #[test]
    fn registered_types_take_precedence() {
        let mut registry = MarshalerRegistry::new();
        registry.register(
            "application/vnd.custom+json",
            Arc::new(json::JsonMarshaler::default()),
        );
        let (inbound, _) =
            registry.for_request(&headers(&[("content-type", "application/vnd.custom+json")]));
        assert_eq!(inbound.content_type(), "application/json");
    }

    #[test]
    fn framer_shapes() {
        assert_eq!(NewlineFramer.frame(b"{}").as_ref(), b"{}\n");
        assert_eq!(SseFramer.frame(b"{}").as_ref(), b"data: {}\n\n");
    }
}
