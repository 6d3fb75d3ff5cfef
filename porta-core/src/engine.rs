//! # Streaming Engine
//!
//! Assembles HTTP responses from backend replies: a single encoded body
//! for unary replies, a framed element stream for streaming replies.
//!
//! ## Framing
//!
//! Each streamed element is wrapped as `{"result": <encoded>}` and a
//! terminal failure appends one `{"error": <status body>}` element; the
//! outer framing (newline-delimited by default, SSE when configured) comes
//! from the marshaller's [`StreamFramer`]. Once the stream's headers are
//! out, errors can only be reported in-band, which is why a zero-element
//! failed stream is still a `200` carrying a single error frame.
//!
//! Trailers are written as real HTTP trailers when the client negotiated
//! `TE: trailers`, appended as one `{"trailer": …}` frame when configured,
//! or dropped.

use crate::invoker::{StreamReply, UnaryReply};
use crate::marshal::Marshaler;
use crate::metadata::{self, RESPONSE_METADATA_PREFIX};
use crate::status::ErrorBody;
use crate::{BoxError, HttpResponse, ResponseBody};
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tonic::Status;
use tonic::metadata::{KeyAndValueRef, MetadataMap};

/// What to do with trailer metadata when the client did not negotiate
/// HTTP trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailerMode {
    /// Drop trailers.
    #[default]
    Omit,
    /// Append them as one `{"trailer": …}` frame (streams only).
    Frame,
}

/// Per-request response-encoding parameters, resolved by the dispatcher.
pub(crate) struct ResponseParams {
    pub marshaler: Arc<dyn Marshaler>,
    pub response_field: Option<String>,
    /// The client sent `TE: trailers`.
    pub te_trailers: bool,
    pub trailer_mode: TrailerMode,
    pub deadline: Option<Instant>,
}

impl ResponseParams {
    fn encode(&self, msg: &prost_reflect::DynamicMessage) -> Result<Bytes, Status> {
        let result = match &self.response_field {
            Some(path) => self.marshaler.encode_field(msg, path),
            None => self.marshaler.encode(msg),
        };
        result.map_err(|err| Status::internal(format!("failed to encode response: {err}")))
    }
}

pub(crate) fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Builds the response for a unary reply.
///
/// Encode failures surface as `Err` so the dispatcher can fall back to a
/// status-mapped body — headers have not been written yet.
pub(crate) fn unary_response(reply: UnaryReply, params: &ResponseParams) -> Result<HttpResponse, Status> {
    let payload = params.encode(&reply.message)?;

    let mut builder = http::Response::builder().status(StatusCode::OK).header(
        CONTENT_TYPE,
        HeaderValue::from_static(params.marshaler.content_type()),
    );
    if let Some(headers) = builder.headers_mut() {
        metadata::append_metadata_headers(headers, &reply.metadata, RESPONSE_METADATA_PREFIX);
    }

    let emit_trailers = params.te_trailers && reply.trailers.iter().next().is_some();
    if !emit_trailers {
        return builder
            .body(full_body(payload))
            .map_err(|e| Status::internal(format!("failed to build response: {e}")));
    }

    for name in metadata::trailer_names(&reply.trailers) {
        builder = builder.header(http::header::TRAILER, name);
    }
    let trailer_map = metadata::trailer_header_map(&reply.trailers);
    let frames = futures_util::stream::iter(vec![
        Ok::<_, BoxError>(Frame::data(payload)),
        Ok(Frame::trailers(trailer_map)),
    ]);
    builder
        .body(StreamBody::new(frames).boxed_unsync())
        .map_err(|e| Status::internal(format!("failed to build response: {e}")))
}

/// Builds the framed streaming response. Headers go out immediately with
/// status `200`; everything after — elements, errors, trailers — is
/// in-band.
pub(crate) fn streamed_response(reply: StreamReply, params: ResponseParams) -> HttpResponse {
    let content_type = params
        .marshaler
        .framer()
        .content_type()
        .unwrap_or_else(|| params.marshaler.content_type());

    let mut builder = http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(headers) = builder.headers_mut() {
        metadata::append_metadata_headers(headers, &reply.metadata, RESPONSE_METADATA_PREFIX);
    }

    enum State {
        Streaming(StreamReply, ResponseParams),
        Trailers(crate::invoker::TrailerReceiver, ResponseParams),
        Done,
    }

    let frames = futures_util::stream::unfold(
        State::Streaming(reply, params),
        |mut state| async move {
            loop {
                match state {
                    State::Streaming(mut reply, params) => {
                        let next = match params.deadline {
                            Some(deadline) => {
                                match tokio::time::timeout_at(deadline, reply.messages.next()).await
                                {
                                    Ok(next) => next,
                                    Err(_) => {
                                        // Dropping the reply cancels the
                                        // backend call.
                                        let frame = error_frame(
                                            &Status::deadline_exceeded("deadline exceeded"),
                                            &params,
                                        );
                                        return Some((Ok(Frame::data(frame)), State::Done));
                                    }
                                }
                            }
                            None => reply.messages.next().await,
                        };
                        match next {
                            Some(Ok(msg)) => match params.encode(&msg) {
                                Ok(payload) => {
                                    let frame = result_frame(&payload, &params);
                                    return Some((
                                        Ok(Frame::data(frame)),
                                        State::Streaming(reply, params),
                                    ));
                                }
                                Err(status) => {
                                    tracing::warn!("failed to encode stream element: {status}");
                                    let frame = error_frame(&status, &params);
                                    return Some((
                                        Ok(Frame::data(frame)),
                                        State::Trailers(reply.trailers, params),
                                    ));
                                }
                            },
                            Some(Err(status)) => {
                                let frame = error_frame(&status, &params);
                                return Some((
                                    Ok(Frame::data(frame)),
                                    State::Trailers(reply.trailers, params),
                                ));
                            }
                            None => {
                                state = State::Trailers(reply.trailers, params);
                            }
                        }
                    }
                    State::Trailers(receiver, params) => {
                        let trailers = receiver.await.unwrap_or_else(|_| MetadataMap::new());
                        if trailers.iter().next().is_none() {
                            return None;
                        }
                        if params.te_trailers {
                            let map = metadata::trailer_header_map(&trailers);
                            return Some((Ok(Frame::trailers(map)), State::Done));
                        }
                        match params.trailer_mode {
                            TrailerMode::Frame => {
                                let frame = trailer_frame(&trailers, &params);
                                return Some((Ok(Frame::data(frame)), State::Done));
                            }
                            TrailerMode::Omit => return None,
                        }
                    }
                    State::Done => return None,
                }
            }
        },
    );

    builder
        .body(StreamBody::new(frames).boxed_unsync())
        .unwrap_or_else(|e| {
            tracing::error!("failed to build streaming response: {e}");
            plain_error_response(&Status::internal("failed to build streaming response"))
        })
}

fn result_frame(payload: &[u8], params: &ResponseParams) -> Bytes {
    let mut chunk = Vec::with_capacity(payload.len() + 12);
    chunk.extend_from_slice(b"{\"result\":");
    chunk.extend_from_slice(payload);
    chunk.push(b'}');
    params.marshaler.framer().frame(&chunk)
}

fn error_frame(status: &Status, params: &ResponseParams) -> Bytes {
    let chunk = serde_json::to_vec(&serde_json::json!({"error": ErrorBody::from_status(status)}))
        .unwrap_or_else(|_| b"{\"error\":{\"code\":13,\"message\":\"\",\"details\":[]}}".to_vec());
    params.marshaler.framer().frame(&chunk)
}

fn trailer_frame(trailers: &MetadataMap, params: &ResponseParams) -> Bytes {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in trailers.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            if let Ok(text) = value.to_str() {
                map.entry(key.as_str().to_string())
                    .or_default()
                    .push(text.to_string());
            }
        }
    }
    let chunk = serde_json::to_vec(&serde_json::json!({"trailer": map}))
        .unwrap_or_else(|_| b"{\"trailer\":{}}".to_vec());
    params.marshaler.framer().frame(&chunk)
}

/// A status-mapped error response with no marshaller involvement, for the
/// paths where none is available.
pub(crate) fn plain_error_response(status: &Status) -> HttpResponse {
    let mut builder = http::Response::builder()
        .status(crate::status::http_status_from_code(status.code()))
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(headers) = builder.headers_mut() {
        metadata::append_metadata_headers(headers, status.metadata(), RESPONSE_METADATA_PREFIX);
    }
    builder
        .body(full_body(ErrorBody::from_status(status).to_bytes()))
        .unwrap_or_else(|_| {
            let mut response = http::Response::new(full_body(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}
