//! A scripted [`GrpcInvoker`] used by the dispatch and streaming tests.
//!
//! Echo semantics: the reply copies the request's `id`, `message`,
//! `int64_value`, `nested` and `tags` fields. Streaming replies repeat the
//! echo with a sequence suffix; client-streaming counts and concatenates.

use futures_util::StreamExt;
use porta_core::invoker::{CallOptions, GrpcInvoker, MessageStream, StreamReply, UnaryReply};
use porta_core::prost_reflect::{DynamicMessage, MethodDescriptor, ReflectMessage, Value};
use std::time::Duration;
use tonic::Status;
use tonic::metadata::MetadataMap;

pub struct EchoInvoker {
    /// Fail every call with this status instead of replying.
    pub fail_with: Option<Status>,
    /// Header metadata attached to successful replies.
    pub header_metadata: MetadataMap,
    /// Trailer metadata attached to successful replies.
    pub trailer_metadata: MetadataMap,
    /// Number of elements produced by streaming replies.
    pub stream_len: usize,
    /// Status appended after the last stream element.
    pub stream_error: Option<Status>,
    /// Sleep before replying, to exercise deadlines.
    pub delay: Option<Duration>,
}

impl Default for EchoInvoker {
    fn default() -> Self {
        Self {
            fail_with: None,
            header_metadata: MetadataMap::new(),
            trailer_metadata: MetadataMap::new(),
            stream_len: 3,
            stream_error: None,
            delay: None,
        }
    }
}

impl EchoInvoker {
    async fn gate(&self) -> Result<(), Status> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.fail_with {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }
}

/// Copies the echoable fields of `request` into a fresh response message.
pub fn echo_response(method: &MethodDescriptor, request: &DynamicMessage) -> DynamicMessage {
    let desc = method.output();
    let mut response = DynamicMessage::new(desc.clone());
    for name in ["id", "message", "int64_value", "nested", "tags"] {
        let Some(src) = request.descriptor().get_field_by_name(name) else {
            continue;
        };
        let Some(dst) = desc.get_field_by_name(name) else {
            continue;
        };
        if request.has_field(&src) {
            response.set_field(&dst, request.get_field(&src).into_owned());
        }
    }
    response
}

fn with_message(method: &MethodDescriptor, base: &DynamicMessage, text: String) -> DynamicMessage {
    let mut msg = base.clone();
    let fd = method
        .output()
        .get_field_by_name("message")
        .expect("echo.EchoResponse has a message field");
    msg.set_field(&fd, Value::String(text));
    msg
}

fn message_text(request: &DynamicMessage) -> String {
    let fd = request
        .descriptor()
        .get_field_by_name("message")
        .expect("echo.EchoRequest has a message field");
    request
        .get_field(&fd)
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn trailer_channel(trailers: MetadataMap) -> tokio::sync::oneshot::Receiver<MetadataMap> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _ = tx.send(trailers);
    rx
}

#[tonic::async_trait]
impl GrpcInvoker for EchoInvoker {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        _options: CallOptions,
    ) -> Result<UnaryReply, Status> {
        self.gate().await?;
        Ok(UnaryReply {
            message: echo_response(method, &request),
            metadata: self.header_metadata.clone(),
            trailers: self.trailer_metadata.clone(),
        })
    }

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        _options: CallOptions,
    ) -> Result<StreamReply, Status> {
        self.gate().await?;
        let base = echo_response(method, &request);
        let text = message_text(&request);
        let method = method.clone();
        let mut items: Vec<Result<DynamicMessage, Status>> = (0..self.stream_len)
            .map(|i| Ok(with_message(&method, &base, format!("{text} - seq {i}"))))
            .collect();
        if let Some(status) = &self.stream_error {
            items.push(Err(status.clone()));
        }
        Ok(StreamReply {
            messages: futures_util::stream::iter(items).boxed(),
            metadata: self.header_metadata.clone(),
            trailers: trailer_channel(self.trailer_metadata.clone()),
        })
    }

    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        _options: CallOptions,
    ) -> Result<UnaryReply, Status> {
        self.gate().await?;
        let messages: Vec<DynamicMessage> = requests
            .filter_map(|item| futures_util::future::ready(item.ok()))
            .collect()
            .await;
        let count = messages.len();
        let concatenated: String = messages.iter().map(message_text).collect();

        let desc = method.output();
        let mut response = DynamicMessage::new(desc.clone());
        let message_fd = desc
            .get_field_by_name("message")
            .expect("echo.EchoResponse has a message field");
        response.set_field(&message_fd, Value::String(concatenated));
        let count_fd = desc
            .get_field_by_name("count")
            .expect("echo.EchoResponse has a count field");
        response.set_field(&count_fd, Value::I32(count as i32));

        let mut metadata = self.header_metadata.clone();
        metadata.insert("count", count.to_string().parse().expect("ascii value"));
        Ok(UnaryReply {
            message: response,
            metadata,
            trailers: self.trailer_metadata.clone(),
        })
    }

    async fn streaming(
        &self,
        method: &MethodDescriptor,
        requests: MessageStream,
        _options: CallOptions,
    ) -> Result<StreamReply, Status> {
        self.gate().await?;
        let method = method.clone();
        let messages = requests
            .map(move |item| {
                item.map(|request| {
                    let base = echo_response(&method, &request);
                    with_message(&method, &base, format!("echo: {}", message_text(&request)))
                })
            })
            .boxed();
        Ok(StreamReply {
            messages,
            metadata: self.header_metadata.clone(),
            trailers: trailer_channel(self.trailer_metadata.clone()),
        })
    }
}
