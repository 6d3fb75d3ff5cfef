//! # Server Mux & Dispatcher
//!
//! [`ServeMux`] is the request multiplexer: it matches an incoming HTTP
//! request against the handler table and drives the matched binding through
//! the full transcoding pipeline.
//!
//! ## Request lifecycle
//!
//! ```text
//! PARSE → INVOKE → STREAM? → WRITE_HEADERS → WRITE_BODY → WRITE_TRAILERS → DONE
//!               └─ ERROR ────────────────────────────────────────────────┘
//! ```
//!
//! Everything up to INVOKE can still fail into a status-mapped error body;
//! once a streaming response has flushed its headers, failures are reported
//! as in-band `{"error": …}` frames instead.
//!
//! The mux is assembled through [`ServeMuxBuilder`], frozen by `build()`,
//! and read-only while serving. Request population order is fixed: URL
//! variables first, then the body binding, then query parameters filtered
//! by what the first two consumed.

use crate::engine::{self, ResponseParams, TrailerMode};
use crate::fieldpath;
use crate::handler::{Binding, BodySpec, HandlerTable, StreamingMode};
use crate::invoker::{CallOptions, GrpcInvoker, MessageStream};
use crate::marshal::{ByteStream, Marshaler, MarshalerRegistry};
use crate::metadata::{self, MetadataAnnotator, MetadataBridge};
use crate::pattern::{PathBindings, split_path};
use crate::query::{self, PathFilter, QueryOptions, Separator};
use crate::{BoxError, HttpResponse};
use futures_util::{StreamExt, TryStreamExt};
use http::request::Parts;
use prost_reflect::{DynamicMessage, Kind, ReflectMessage, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::Status;

/// The request multiplexer. Built once, then shared read-only across
/// request tasks.
pub struct ServeMux {
    table: HandlerTable,
    registry: MarshalerRegistry,
    bridge: MetadataBridge,
    invoker: Arc<dyn GrpcInvoker>,
    query: QueryOptions,
    trailer_mode: TrailerMode,
}

impl ServeMux {
    /// Starts a builder around the given backend invoker.
    pub fn builder(invoker: Arc<dyn GrpcInvoker>) -> ServeMuxBuilder {
        ServeMuxBuilder {
            table: HandlerTable::new(),
            registry: MarshalerRegistry::new(),
            bridge: MetadataBridge::new(),
            invoker,
            query: QueryOptions::default(),
            trailer_mode: TrailerMode::default(),
        }
    }

    /// Dispatches one request: routing, decoding, invocation, response
    /// encoding. Never fails — every error becomes a status-mapped
    /// response.
    pub async fn dispatch(
        &self,
        parts: Parts,
        body: ByteStream,
        remote_addr: Option<SocketAddr>,
    ) -> HttpResponse {
        let path = parts.uri.path().to_string();
        if !path.starts_with('/') {
            return engine::plain_error_response(&Status::invalid_argument(
                "malformed request path",
            ));
        }
        let Some((components, verb)) = split_path(&path) else {
            return engine::plain_error_response(&Status::not_found(
                "no route matched the request path",
            ));
        };

        let mut method_mismatch = false;
        let mut matched: Option<(&Binding, PathBindings)> = None;
        for binding in self.table.iter() {
            if let Some(bindings) = binding.pattern().matches(&components, verb) {
                if *binding.http_method() == parts.method {
                    matched = Some((binding, bindings));
                    break;
                }
                method_mismatch = true;
            }
        }

        let Some((binding, path_bindings)) = matched else {
            let status = if method_mismatch {
                Status::unimplemented("method not implemented for the request path")
            } else {
                Status::not_found("no route matched the request path")
            };
            return engine::plain_error_response(&status);
        };

        tracing::debug!(
            method = %parts.method,
            pattern = %binding.pattern(),
            rpc = binding.rpc().full_name(),
            "dispatching request",
        );
        self.serve(binding, path_bindings, parts, body, remote_addr)
            .await
    }

    async fn serve(
        &self,
        binding: &Binding,
        path_bindings: PathBindings,
        parts: Parts,
        body: ByteStream,
        remote_addr: Option<SocketAddr>,
    ) -> HttpResponse {
        let te_trailers = metadata::wants_trailers(&parts.headers);
        let (inbound, outbound) = self.registry.for_request(&parts.headers);

        let (metadata_map, timeout) = match self.bridge.annotate(&parts, remote_addr) {
            Ok(annotated) => annotated,
            Err(err) => {
                return engine::plain_error_response(&Status::invalid_argument(err.to_string()));
            }
        };
        if timeout == Some(Duration::ZERO) {
            return engine::plain_error_response(&Status::deadline_exceeded("deadline exceeded"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let params = ResponseParams {
            marshaler: outbound,
            response_field: binding.response_body_path().map(str::to_string),
            te_trailers,
            trailer_mode: self.trailer_mode,
            deadline,
        };
        let options = CallOptions {
            metadata: metadata_map,
            timeout,
        };

        match binding.mode() {
            StreamingMode::Unary | StreamingMode::ServerStreaming => {
                let msg = match self
                    .build_request_message(binding, &path_bindings, &parts, body, &inbound)
                    .await
                {
                    Ok(msg) => msg,
                    Err(status) => return engine::plain_error_response(&status),
                };
                if binding.mode() == StreamingMode::Unary {
                    let call = self.invoker.unary(binding.rpc(), msg, options);
                    match await_with_deadline(deadline, call).await {
                        Ok(reply) => engine::unary_response(reply, &params)
                            .unwrap_or_else(|status| engine::plain_error_response(&status)),
                        Err(status) => engine::plain_error_response(&status),
                    }
                } else {
                    let call = self.invoker.server_streaming(binding.rpc(), msg, options);
                    match await_with_deadline(deadline, call).await {
                        Ok(reply) => engine::streamed_response(reply, params),
                        Err(status) => engine::plain_error_response(&status),
                    }
                }
            }
            StreamingMode::ClientStreaming | StreamingMode::Bidi => {
                // Streamed requests take their messages from the body
                // frames alone; URL variables and query parameters do not
                // apply per-element.
                let frames = inbound.stream_decoder(body, binding.request_descriptor());
                let requests: MessageStream = frames
                    .map(|frame| {
                        frame.map_err(|err| {
                            Status::invalid_argument(format!("malformed request frame: {err}"))
                        })
                    })
                    .boxed();
                if binding.mode() == StreamingMode::ClientStreaming {
                    let call = self.invoker.client_streaming(binding.rpc(), requests, options);
                    match await_with_deadline(deadline, call).await {
                        Ok(reply) => engine::unary_response(reply, &params)
                            .unwrap_or_else(|status| engine::plain_error_response(&status)),
                        Err(status) => engine::plain_error_response(&status),
                    }
                } else {
                    let call = self.invoker.streaming(binding.rpc(), requests, options);
                    match await_with_deadline(deadline, call).await {
                        Ok(reply) => engine::streamed_response(reply, params),
                        Err(status) => engine::plain_error_response(&status),
                    }
                }
            }
        }
    }

    /// Builds the request message in the fixed population order: URL
    /// variables, then the body binding, then query parameters.
    async fn build_request_message(
        &self,
        binding: &Binding,
        path_bindings: &PathBindings,
        parts: &Parts,
        body: ByteStream,
        inbound: &Arc<dyn Marshaler>,
    ) -> Result<DynamicMessage, Status> {
        let desc = binding.request_descriptor();
        let mut msg = DynamicMessage::new(desc.clone());
        let mut filter = PathFilter::new();

        for (name, value) in path_bindings {
            fieldpath::set_field_by_path(&mut msg, name, &[value.as_str()]).map_err(|err| {
                Status::invalid_argument(format!("invalid path parameter '{name}': {err}"))
            })?;
            filter.insert(name);
        }

        match binding.body_spec() {
            BodySpec::None => {}
            BodySpec::All => {
                let buf = collect_body(body).await?;
                let decoded = inbound.decode(&buf, desc.clone()).map_err(|err| {
                    Status::invalid_argument(format!("malformed request body: {err}"))
                })?;
                merge_set_fields(&mut msg, decoded);
            }
            BodySpec::Field(path) => {
                let resolved = fieldpath::resolve_path(&desc, path).map_err(|err| {
                    Status::invalid_argument(format!("invalid body binding '{path}': {err}"))
                })?;
                let field_desc = match resolved.leaf().kind() {
                    Kind::Message(d) if !resolved.leaf().is_list() && !resolved.leaf().is_map() => d,
                    _ => {
                        return Err(Status::invalid_argument(format!(
                            "body binding '{path}' must be a singular message field"
                        )));
                    }
                };
                let buf = collect_body(body).await?;
                let decoded = inbound.decode(&buf, field_desc).map_err(|err| {
                    Status::invalid_argument(format!("malformed request body: {err}"))
                })?;
                fieldpath::set_value_by_path(&mut msg, path, Value::Message(decoded)).map_err(
                    |err| Status::invalid_argument(format!("invalid body binding '{path}': {err}")),
                )?;
                filter.insert(path);
            }
        }

        if !matches!(binding.body_spec(), BodySpec::All) {
            if let Some(raw) = parts.uri.query() {
                let entries = query::parse_query(raw);
                query::decode_query(&mut msg, &entries, &filter, &self.query)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?;
            }
        }

        Ok(msg)
    }
}

/// Copies every populated top-level field of `source` into `target`.
///
/// Later body fields overwrite earlier URL-variable writes field by field;
/// fields absent from the body leave the target untouched.
fn merge_set_fields(target: &mut DynamicMessage, source: DynamicMessage) {
    for fd in source.descriptor().fields() {
        if source.has_field(&fd) {
            target.set_field(&fd, source.get_field(&fd).into_owned());
        }
    }
}

async fn collect_body(body: ByteStream) -> Result<Vec<u8>, Status> {
    body.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
    .map_err(|err: BoxError| Status::invalid_argument(format!("failed to read request body: {err}")))
}

async fn await_with_deadline<T>(
    deadline: Option<Instant>,
    call: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("deadline exceeded")),
        },
        None => call.await,
    }
}

/// Configures and freezes a [`ServeMux`].
pub struct ServeMuxBuilder {
    table: HandlerTable,
    registry: MarshalerRegistry,
    bridge: MetadataBridge,
    invoker: Arc<dyn GrpcInvoker>,
    query: QueryOptions,
    trailer_mode: TrailerMode,
}

impl ServeMuxBuilder {
    /// Registers a route binding.
    pub fn handle(mut self, binding: Binding) -> Self {
        self.table.push(binding);
        self
    }

    /// Registers a marshaller for a media type (`"*"` for the wildcard).
    pub fn marshaler(mut self, mime: &str, marshaler: Arc<dyn Marshaler>) -> Self {
        self.registry.register(mime, marshaler);
        self
    }

    /// Allows a request header to forward as gRPC metadata.
    pub fn allow_header(mut self, name: &str) -> Self {
        self.bridge.allow_header(name);
        self
    }

    /// Adds a metadata annotator hook.
    pub fn annotator(mut self, annotator: MetadataAnnotator) -> Self {
        self.bridge.add_annotator(annotator);
        self
    }

    /// Applies a default deadline to requests that carry no
    /// `Grpc-Timeout` header.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.bridge.set_default_timeout(Some(timeout));
        self
    }

    /// Rejects unknown query parameters instead of ignoring them.
    pub fn strict_query(mut self) -> Self {
        self.query.strict = true;
        self
    }

    /// Sets the separator for packed repeated query values.
    pub fn query_separator(mut self, separator: Separator) -> Self {
        self.query.separator = separator;
        self
    }

    /// Chooses what happens to trailers for clients that did not send
    /// `TE: trailers`.
    pub fn trailer_mode(mut self, mode: TrailerMode) -> Self {
        self.trailer_mode = mode;
        self
    }

    /// Freezes the table and produces the mux.
    pub fn build(mut self) -> ServeMux {
        self.table.freeze();
        ServeMux {
            table: self.table,
            registry: self.registry,
            bridge: self.bridge,
            invoker: self.invoker,
            query: self.query,
            trailer_mode: self.trailer_mode,
        }
    }
}
