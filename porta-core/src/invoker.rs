//! # gRPC Invoker Abstraction
//!
//! The dispatcher talks to the backend through [`GrpcInvoker`], a call-site
//! abstraction over the four RPC cardinalities. The crate ships a
//! tonic-backed implementation in [`crate::grpc`]; tests substitute scripted
//! implementations.
//!
//! Replies separate header metadata from trailer metadata. For streaming
//! replies the trailers only exist once the stream is drained, so they
//! arrive through a oneshot [`TrailerReceiver`] resolved at end-of-stream.

use futures_util::stream::BoxStream;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::time::Duration;
use tonic::Status;
use tonic::metadata::MetadataMap;

/// A finite, cancellable sequence of messages in one direction.
///
/// Cancellation is dropping the stream; an `Err` item carries the terminal
/// gRPC status.
pub type MessageStream = BoxStream<'static, Result<DynamicMessage, Status>>;

/// Receives the trailer metadata after a streaming reply is drained.
///
/// The sender side may be dropped without sending (transport loss); treat
/// that as empty trailers.
pub type TrailerReceiver = tokio::sync::oneshot::Receiver<MetadataMap>;

/// Per-call options derived from the HTTP request.
#[derive(Debug, Default)]
pub struct CallOptions {
    /// Outgoing gRPC metadata.
    pub metadata: MetadataMap,
    /// Remaining time budget, when the request carries a deadline.
    pub timeout: Option<Duration>,
}

/// A single-message reply.
#[derive(Debug)]
pub struct UnaryReply {
    pub message: DynamicMessage,
    /// Header metadata produced by the backend.
    pub metadata: MetadataMap,
    /// Trailer metadata produced by the backend.
    pub trailers: MetadataMap,
}

/// A streaming reply.
pub struct StreamReply {
    pub messages: MessageStream,
    /// Header metadata, available as soon as the call is established.
    pub metadata: MetadataMap,
    /// Trailer metadata, resolved once `messages` ends.
    pub trailers: TrailerReceiver,
}

/// The backend call-site abstraction consumed by the dispatcher.
#[tonic::async_trait]
pub trait GrpcInvoker: Send + Sync + 'static {
    /// Single request, single response.
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        options: CallOptions,
    ) -> Result<UnaryReply, Status>;

    /// Single request, stream of responses.
    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        options: CallOptions,
    ) -> Result<StreamReply, Status>;

    /// Stream of requests, single response.
    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        options: CallOptions,
    ) -> Result<UnaryReply, Status>;

    /// Bidirectional streaming.
    async fn streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        options: CallOptions,
    ) -> Result<StreamReply, Status>;
}
