//! # Channel Invoker
//!
//! Wraps a `tonic` service to provide the [`GrpcInvoker`] contract over a
//! real transport. It is agnostic to the messages being exchanged: the
//! [`DynamicCodec`] serializes whatever [`DynamicMessage`]s the dispatcher
//! hands it, and the HTTP/2 path is constructed from the method descriptor
//! at call time.
//!
//! One transport caveat: for calls with a unary response, `tonic` merges
//! the backend's trailer metadata into the response metadata, so the
//! trailer map of a [`UnaryReply`] produced here is empty. Streaming
//! replies deliver their trailers through the [`StreamReply`] receiver once
//! the stream is drained.

use super::codec::DynamicCodec;
use crate::BoxError;
use crate::invoker::{CallOptions, GrpcInvoker, MessageStream, StreamReply, UnaryReply};
use futures_util::StreamExt;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::str::FromStr;
use tokio::sync::oneshot;
use tonic::client::GrpcService;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};

/// Errors that can occur when connecting to a gRPC backend.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid backend URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

/// The stock invoker: a generic dynamic gRPC client over any tonic service.
#[derive(Debug, Clone)]
pub struct ChannelInvoker<S = Channel> {
    service: S,
}

impl ChannelInvoker<Channel> {
    /// Connects to a gRPC backend.
    ///
    /// # Arguments
    ///
    /// * `addr` - The backend URI (e.g., `http://localhost:50051`).
    pub async fn connect(addr: &str) -> Result<Self, ConnectError> {
        let endpoint = Endpoint::new(addr.to_string())
            .map_err(|e| ConnectError::InvalidUrl(addr.to_string(), e))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ConnectError::ConnectionFailed(addr.to_string(), e))?;
        Ok(Self::new(channel))
    }
}

impl<S> ChannelInvoker<S> {
    /// Creates an invoker from an existing tonic service/channel.
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> ChannelInvoker<S>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    async fn ready(&self) -> Result<tonic::client::Grpc<S>, Status> {
        let mut grpc = tonic::client::Grpc::new(self.service.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend is not ready: {}", e.into())))?;
        Ok(grpc)
    }
}

fn rpc_path(method: &MethodDescriptor) -> http::uri::PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path).expect("valid gRPC path")
}

fn build_request<T>(payload: T, options: CallOptions) -> Request<T> {
    let mut request = Request::new(payload);
    *request.metadata_mut() = options.metadata;
    if let Some(timeout) = options.timeout {
        request.set_timeout(timeout);
    }
    request
}

/// Drops the `Err` tail of a decoded request stream; the send side simply
/// closes early and the backend replies as it sees fit.
fn into_send_stream(
    requests: MessageStream,
) -> impl futures_util::Stream<Item = DynamicMessage> + Send + 'static {
    requests
        .inspect(|item| {
            if let Err(status) = item {
                tracing::warn!("request stream ended early: {status}");
            }
        })
        .take_while(|item| futures_util::future::ready(item.is_ok()))
        .filter_map(|item| futures_util::future::ready(item.ok()))
}

/// Adapts a tonic [`Streaming`] into a [`MessageStream`] plus a trailer
/// receiver resolved at end-of-stream.
fn split_stream(inner: Streaming<DynamicMessage>) -> (MessageStream, oneshot::Receiver<MetadataMap>) {
    let (tx, rx) = oneshot::channel();
    let stream = futures_util::stream::unfold(Some((inner, tx)), |state| async move {
        let (mut inner, tx) = state?;
        match inner.message().await {
            Ok(Some(msg)) => Some((Ok(msg), Some((inner, tx)))),
            Ok(None) => {
                let trailers = match inner.trailers().await {
                    Ok(Some(trailers)) => trailers,
                    Ok(None) => MetadataMap::new(),
                    Err(status) => {
                        tracing::debug!("failed to read trailers: {status}");
                        MetadataMap::new()
                    }
                };
                let _ = tx.send(trailers);
                None
            }
            Err(status) => {
                let _ = tx.send(status.metadata().clone());
                Some((Err(status), None))
            }
        }
    })
    .boxed();
    (stream, rx)
}

#[tonic::async_trait]
impl<S> GrpcInvoker for ChannelInvoker<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        options: CallOptions,
    ) -> Result<UnaryReply, Status> {
        let mut grpc = self.ready().await?;
        let codec = DynamicCodec::new(method.input(), method.output());
        let response = grpc
            .unary(build_request(request, options), rpc_path(method), codec)
            .await?;
        let (metadata, message, _) = response.into_parts();
        Ok(UnaryReply {
            message,
            metadata,
            trailers: MetadataMap::new(),
        })
    }

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        options: CallOptions,
    ) -> Result<StreamReply, Status> {
        let mut grpc = self.ready().await?;
        let codec = DynamicCodec::new(method.input(), method.output());
        let response = grpc
            .server_streaming(build_request(request, options), rpc_path(method), codec)
            .await?;
        let (metadata, streaming, _) = response.into_parts();
        let (messages, trailers) = split_stream(streaming);
        Ok(StreamReply {
            messages,
            metadata,
            trailers,
        })
    }

    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        options: CallOptions,
    ) -> Result<UnaryReply, Status> {
        let mut grpc = self.ready().await?;
        let codec = DynamicCodec::new(method.input(), method.output());
        let send = into_send_stream(requests);
        let response = grpc
            .client_streaming(build_request(send, options), rpc_path(method), codec)
            .await?;
        let (metadata, message, _) = response.into_parts();
        Ok(UnaryReply {
            message,
            metadata,
            trailers: MetadataMap::new(),
        })
    }

    async fn streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        options: CallOptions,
    ) -> Result<StreamReply, Status> {
        let mut grpc = self.ready().await?;
        let codec = DynamicCodec::new(method.input(), method.output());
        let send = into_send_stream(requests);
        let response = grpc
            .streaming(build_request(send, options), rpc_path(method), codec)
            .await?;
        let (metadata, streaming, _) = response.into_parts();
        let (messages, trailers) = split_stream(streaming);
        Ok(StreamReply {
            messages,
            metadata,
            trailers,
        })
    }
}
