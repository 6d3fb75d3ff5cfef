//! Streaming-path tests: frame shapes, ordering, error footers, trailer
//! delivery and the zero-element boundary behaviours.

mod echo_invoker;

use bytes::Bytes;
use echo_invoker::EchoInvoker;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use porta_core::HttpResponse;
use porta_core::engine::TrailerMode;
use porta_core::handler::Binding;
use porta_core::marshal::ByteStream;
use porta_core::mux::ServeMux;
use std::sync::Arc;
use tonic::{Code, Status};
use tonic::metadata::MetadataMap;

fn routes(invoker: EchoInvoker) -> ServeMux {
    streaming_builder(invoker).build()
}

fn streaming_builder(invoker: EchoInvoker) -> porta_core::mux::ServeMuxBuilder {
    ServeMux::builder(Arc::new(invoker))
        .handle(
            Binding::new(
                Method::POST,
                "/v1/stream",
                echo_service::method("ServerStreamingEcho"),
            )
            .unwrap()
            .body("*"),
        )
        .handle(
            Binding::new(Method::POST, "/v1/chat", echo_service::method("BidiEcho"))
                .unwrap()
                .body("*"),
        )
}

fn parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let (parts, ()) = builder.body(()).unwrap().into_parts();
    parts
}

fn body_of(bytes: &[u8]) -> ByteStream {
    futures_util::stream::iter(vec![Ok(Bytes::copy_from_slice(bytes))]).boxed()
}

async fn read(response: HttpResponse) -> (StatusCode, HeaderMap, Bytes, Option<HeaderMap>) {
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.expect("body collects");
    let trailers = collected.trailers().cloned();
    (parts.status, parts.headers, collected.to_bytes(), trailers)
}

fn frames(body: &Bytes) -> Vec<serde_json::Value> {
    std::str::from_utf8(body)
        .expect("utf-8 body")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("valid JSON frame"))
        .collect()
}

#[tokio::test]
async fn server_streaming_frames_in_order() {
    let mux = routes(EchoInvoker::default());
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"stream"}"#),
            None,
        )
        .await;
    let (status, headers, body, _) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    let frames = frames(&body);
    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(
            frame["result"]["message"],
            format!("stream - seq {i}"),
            "frame {i}"
        );
    }
}

#[tokio::test]
async fn zero_element_stream_with_success_is_empty_200() {
    let mux = routes(EchoInvoker {
        stream_len: 0,
        ..EchoInvoker::default()
    });
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"x"}"#),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn zero_element_stream_with_error_is_error_frame_200() {
    let mux = routes(EchoInvoker {
        stream_len: 0,
        stream_error: Some(Status::internal("backend exploded")),
        ..EchoInvoker::default()
    });
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"x"}"#),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    // Headers were already flushed as 200; the error is in-band.
    assert_eq!(status, StatusCode::OK);
    let frames = frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["error"]["code"], Code::Internal as i32);
    assert_eq!(frames[0]["error"]["message"], "backend exploded");
}

#[tokio::test]
async fn mid_stream_error_appends_error_footer() {
    let mux = routes(EchoInvoker {
        stream_len: 2,
        stream_error: Some(Status::unavailable("lost backend")),
        ..EchoInvoker::default()
    });
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"s"}"#),
            None,
        )
        .await;
    let (_, _, body, _) = read(response).await;
    let frames = frames(&body);
    assert_eq!(frames.len(), 3);
    assert!(frames[0].get("result").is_some());
    assert!(frames[1].get("result").is_some());
    assert_eq!(frames[2]["error"]["code"], Code::Unavailable as i32);
}

#[tokio::test]
async fn initial_stream_failure_is_a_mapped_status_body() {
    let mux = routes(EchoInvoker {
        fail_with: Some(Status::permission_denied("nope")),
        ..EchoInvoker::default()
    });
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"x"}"#),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    // The call failed before any header was flushed.
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], Code::PermissionDenied as i32);
}

#[tokio::test]
async fn bidi_echoes_each_frame() {
    let mux = routes(EchoInvoker::default());
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/chat", &[]),
            body_of(b"{\"message\":\"Ping\"}\n{\"message\":\"Pong\"}\n"),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    let frames = frames(&body);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["result"]["message"], "echo: Ping");
    assert_eq!(frames[1]["result"]["message"], "echo: Pong");
}

#[tokio::test]
async fn malformed_stream_frame_becomes_inband_error() {
    let mux = routes(EchoInvoker::default());
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/chat", &[]),
            body_of(b"{\"message\":\"ok\"}\nnot json\n"),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    let frames = frames(&body);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["result"]["message"], "echo: ok");
    assert_eq!(frames[1]["error"]["code"], Code::InvalidArgument as i32);
}

#[tokio::test]
async fn negotiated_trailers_follow_the_stream() {
    let mut trailer_metadata = MetadataMap::new();
    trailer_metadata.insert("count", "3".parse().unwrap());
    let mux = routes(EchoInvoker {
        trailer_metadata,
        ..EchoInvoker::default()
    });
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[("te", "trailers")]),
            body_of(br#"{"message":"s"}"#),
            None,
        )
        .await;
    let (status, _, body, trailers) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames(&body).len(), 3);
    let trailers = trailers.expect("trailers negotiated");
    assert_eq!(trailers.get("grpc-trailer-count").unwrap(), "3");
}

#[tokio::test]
async fn trailer_frame_mode_appends_a_trailer_chunk() {
    let mut trailer_metadata = MetadataMap::new();
    trailer_metadata.insert("count", "1".parse().unwrap());
    let mux = streaming_builder(EchoInvoker {
        stream_len: 1,
        trailer_metadata,
        ..EchoInvoker::default()
    })
    .trailer_mode(TrailerMode::Frame)
    .build();
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[]),
            body_of(br#"{"message":"s"}"#),
            None,
        )
        .await;
    let (_, _, body, trailers) = read(response).await;
    assert!(trailers.is_none());
    let frames = frames(&body);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1], serde_json::json!({"trailer": {"count": ["1"]}}));
}

#[tokio::test]
async fn stream_deadline_produces_inband_deadline_error() {
    // An invoker whose stream never yields: the per-element deadline fires
    // and the body carries a DEADLINE_EXCEEDED frame.
    struct StallingInvoker;

    #[tonic::async_trait]
    impl porta_core::invoker::GrpcInvoker for StallingInvoker {
        async fn unary(
            &self,
            _: &porta_core::prost_reflect::MethodDescriptor,
            _: porta_core::prost_reflect::DynamicMessage,
            _: porta_core::invoker::CallOptions,
        ) -> Result<porta_core::invoker::UnaryReply, Status> {
            Err(Status::unimplemented("unused"))
        }

        async fn server_streaming(
            &self,
            _: &porta_core::prost_reflect::MethodDescriptor,
            _: porta_core::prost_reflect::DynamicMessage,
            _: porta_core::invoker::CallOptions,
        ) -> Result<porta_core::invoker::StreamReply, Status> {
            let (_tx, rx) = tokio::sync::oneshot::channel();
            Ok(porta_core::invoker::StreamReply {
                messages: futures_util::stream::pending().boxed(),
                metadata: MetadataMap::new(),
                trailers: rx,
            })
        }

        async fn client_streaming(
            &self,
            _: &porta_core::prost_reflect::MethodDescriptor,
            _: porta_core::invoker::MessageStream,
            _: porta_core::invoker::CallOptions,
        ) -> Result<porta_core::invoker::UnaryReply, Status> {
            Err(Status::unimplemented("unused"))
        }

        async fn streaming(
            &self,
            _: &porta_core::prost_reflect::MethodDescriptor,
            _: porta_core::invoker::MessageStream,
            _: porta_core::invoker::CallOptions,
        ) -> Result<porta_core::invoker::StreamReply, Status> {
            Err(Status::unimplemented("unused"))
        }
    }

    let mux = ServeMux::builder(Arc::new(StallingInvoker))
        .handle(
            Binding::new(
                Method::POST,
                "/v1/stream",
                echo_service::method("ServerStreamingEcho"),
            )
            .unwrap()
            .body("*"),
        )
        .build();
    let response = mux
        .dispatch(
            parts(Method::POST, "/v1/stream", &[("grpc-timeout", "20m")]),
            body_of(br#"{"message":"x"}"#),
            None,
        )
        .await;
    let (status, _, body, _) = read(response).await;
    assert_eq!(status, StatusCode::OK);
    let frames = frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["error"]["code"], Code::DeadlineExceeded as i32);
}
