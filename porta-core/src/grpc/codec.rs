//! # Dynamic Protobuf Codec
//!
//! Implements `tonic::codec::Codec` for [`DynamicMessage`] so `tonic` can
//! transport request and response messages the gateway assembled at
//! runtime, without generated Rust structs.
//!
//! The encoder writes the message's wire bytes straight into the gRPC
//! frame; the decoder merges the frame into a fresh message built from the
//! response descriptor.

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// A codec that carries [`DynamicMessage`] values in both directions.
///
/// It holds the descriptors for the request and response messages so the
/// decoder knows what to build.
pub struct DynamicCodec {
    req_desc: MessageDescriptor,
    res_desc: MessageDescriptor,
}

impl DynamicCodec {
    /// Creates a new `DynamicCodec` for one method's request and response
    /// types.
    pub fn new(req_desc: MessageDescriptor, res_desc: MessageDescriptor) -> Self {
        Self { req_desc, res_desc }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder(self.req_desc.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.res_desc.clone())
    }
}

/// Writes a message's wire bytes into the outgoing frame.
pub struct DynamicEncoder(MessageDescriptor);

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        if item.descriptor() != self.0 {
            return Err(Status::internal(format!(
                "request message is '{}', expected '{}'",
                item.descriptor().full_name(),
                self.0.full_name(),
            )));
        }
        item.encode_raw(dst);
        Ok(())
    }
}

/// Builds a message from the response descriptor and merges the incoming
/// frame into it.
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut msg = DynamicMessage::new(self.0.clone());
        msg.merge(src)
            .map_err(|e| Status::internal(format!("failed to decode response frame: {e}")))?;
        Ok(Some(msg))
    }
}
