//! # Handler Table
//!
//! A [`Binding`] ties one HTTP route — method plus compiled URL template —
//! to one gRPC method, together with its body and response-body field
//! bindings. The [`HandlerTable`] holds every binding of the service,
//! ordered for dispatch.
//!
//! Ordering is fixed at freeze time: descending literal-segment count,
//! then descending bound-variable count, then declaration order. The table
//! is built once at startup and read-only afterwards.

use crate::pattern::{Pattern, PatternError};
use prost_reflect::{MessageDescriptor, MethodDescriptor};

/// RPC cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidi,
}

impl StreamingMode {
    /// Derives the mode from a method descriptor's streaming flags.
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => StreamingMode::Unary,
            (true, false) => StreamingMode::ClientStreaming,
            (false, true) => StreamingMode::ServerStreaming,
            (true, true) => StreamingMode::Bidi,
        }
    }
}

/// Where the request body lands in the request message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BodySpec {
    /// No body is decoded.
    #[default]
    None,
    /// The whole body decodes into the request message (`*`).
    All,
    /// The body decodes into one field of the request message.
    Field(String),
}

impl BodySpec {
    /// Parses the annotation form: empty for none, `*` for the whole
    /// message, a field path otherwise.
    pub fn parse(spec: &str) -> Self {
        match spec {
            "" => BodySpec::None,
            "*" => BodySpec::All,
            path => BodySpec::Field(path.to_string()),
        }
    }
}

/// One HTTP route → gRPC method declaration.
#[derive(Debug, Clone)]
pub struct Binding {
    method: http::Method,
    pattern: Pattern,
    body: BodySpec,
    response_body: Option<String>,
    rpc: MethodDescriptor,
    mode: StreamingMode,
}

impl Binding {
    /// Compiles a binding from an HTTP method, a URL template and the gRPC
    /// method it maps to.
    pub fn new(
        method: http::Method,
        template: &str,
        rpc: MethodDescriptor,
    ) -> Result<Self, PatternError> {
        let pattern = Pattern::parse(template)?;
        let mode = StreamingMode::of(&rpc);
        Ok(Self {
            method,
            pattern,
            body: BodySpec::None,
            response_body: None,
            rpc,
            mode,
        })
    }

    /// Sets the body binding (`""`, `"*"`, or a field path).
    pub fn body(mut self, spec: &str) -> Self {
        self.body = BodySpec::parse(spec);
        self
    }

    /// Sets the response-body field path (`""` and `"*"` mean the whole
    /// message).
    pub fn response_body(mut self, path: &str) -> Self {
        self.response_body = match path {
            "" | "*" => None,
            path => Some(path.to_string()),
        };
        self
    }

    pub fn http_method(&self) -> &http::Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn body_spec(&self) -> &BodySpec {
        &self.body
    }

    pub fn response_body_path(&self) -> Option<&str> {
        self.response_body.as_deref()
    }

    pub fn rpc(&self) -> &MethodDescriptor {
        &self.rpc
    }

    pub fn request_descriptor(&self) -> MessageDescriptor {
        self.rpc.input()
    }

    pub fn mode(&self) -> StreamingMode {
        self.mode
    }
}

/// The frozen, ordered collection of bindings.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    bindings: Vec<Binding>,
    frozen: bool,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a binding in declaration order.
    pub fn push(&mut self, binding: Binding) {
        debug_assert!(!self.frozen, "bindings added after freeze are not re-sorted");
        self.bindings.push(binding);
    }

    /// Sorts the table into dispatch order. Stable, so equally specific
    /// bindings keep their declaration order.
    pub fn freeze(&mut self) {
        self.bindings.sort_by_key(|b| {
            (
                std::cmp::Reverse(b.pattern().literals()),
                std::cmp::Reverse(b.pattern().variables()),
            )
        });
        self.frozen = true;
    }

    /// Iterates bindings in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}
