//! # Protobuf Binary Marshaller
//!
//! Straight wire-format encode/decode for clients speaking
//! `application/x-protobuf`. Stream decoding treats the whole body as a
//! single frame; length-prefixed framing is left to a custom registration.

use super::{ByteStream, DecodeError, EncodeError, Marshaler, MessageFrames, NewlineFramer, StreamFramer};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage, Value};
use std::sync::Arc;

/// The wire-format marshaller.
#[derive(Debug, Default)]
pub struct ProtoMarshaler;

impl Marshaler for ProtoMarshaler {
    fn content_type(&self) -> &'static str {
        "application/x-protobuf"
    }

    fn decode(&self, buf: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage, DecodeError> {
        Ok(DynamicMessage::decode(desc, buf)?)
    }

    fn encode(&self, msg: &DynamicMessage) -> Result<Bytes, EncodeError> {
        Ok(msg.encode_to_vec().into())
    }

    fn encode_field(&self, msg: &DynamicMessage, path: &str) -> Result<Bytes, EncodeError> {
        let mut current = msg.clone();
        for segment in path.split('.') {
            let desc = current.descriptor();
            let fd = desc
                .get_field_by_name(segment)
                .or_else(|| desc.get_field_by_json_name(segment))
                .ok_or_else(|| EncodeError::FieldNotFound {
                    path: path.to_string(),
                    message: desc.full_name().to_string(),
                })?;
            current = match current.get_field(&fd).into_owned() {
                Value::Message(m) => m,
                // Only message-typed response fields have a wire form of
                // their own.
                _ => {
                    return Err(EncodeError::UnsupportedField {
                        path: path.to_string(),
                        media_type: self.content_type().to_string(),
                    });
                }
            };
        }
        Ok(current.encode_to_vec().into())
    }

    fn stream_decoder(&self, body: ByteStream, desc: MessageDescriptor) -> MessageFrames {
        // One frame per body: binary clients carry a single message.
        async fn collect(body: ByteStream) -> Result<Vec<u8>, DecodeError> {
            body.try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(DecodeError::Read)
        }
        futures_util::stream::once(async move {
            let buf = collect(body).await?;
            Ok(DynamicMessage::decode(desc, buf.as_slice())?)
        })
        .boxed()
    }

    fn framer(&self) -> Arc<dyn StreamFramer> {
        Arc::new(NewlineFramer)
    }
}
