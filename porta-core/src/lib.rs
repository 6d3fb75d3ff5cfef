//! # Porta Core
//!
//! `porta_core` is the runtime powering the porta gateway: a bidirectional
//! translator between a RESTful JSON/HTTP interface and a gRPC backend.
//!
//! ## Key Components
//!
//! * **[`pattern`]:** URL template compilation and matching.
//! * **[`fieldpath`] & [`query`]:** dotted-field-path resolution and
//!   query-parameter decoding into [`prost_reflect::DynamicMessage`]s.
//! * **[`marshal`]:** the media-type registry with the canonical JSON and
//!   binary protobuf marshallers, plus stream framing.
//! * **[`fieldmask`]:** partial-update mask derivation from JSON bodies.
//! * **[`handler`] & [`mux`]:** the frozen handler table and the request
//!   dispatcher.
//! * **[`metadata`]:** HTTP header ⇄ gRPC metadata translation, including
//!   `Grpc-Timeout` deadlines and trailer negotiation.
//! * **[`status`]:** gRPC ⇄ HTTP status mapping and the structured error
//!   body.
//! * **[`engine`]:** response assembly for unary and streamed replies.
//! * **[`invoker`] & [`grpc`]:** the backend call abstraction and its
//!   tonic-backed implementation.
//!
//! The mux and its registries are built once at startup and are read-only
//! while serving; per-request state lives on the handling task and
//! cancellation is drop-based.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect` and `tonic` to ensure
//! that consumers use compatible versions of these underlying dependencies.

pub mod engine;
pub mod fieldmask;
pub mod fieldpath;
pub mod grpc;
pub mod handler;
pub mod invoker;
pub mod marshal;
pub mod metadata;
pub mod mux;
pub mod pattern;
pub mod query;
pub mod status;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The response body type produced by the dispatcher.
pub type ResponseBody = http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, BoxError>;

/// A complete HTTP response as produced by the dispatcher.
pub type HttpResponse = http::Response<ResponseBody>;
