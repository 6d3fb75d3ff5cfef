//! # Porta
//!
//! The HTTP frontend of the porta gateway: wraps a
//! [`porta_core::mux::ServeMux`] in an [`axum`] router so any hyper-based
//! server (and any tower middleware stack) can sit in front of the
//! transcoding runtime.
//!
//! ```rust,no_run
//! use porta::{Gateway, ServeMux, Binding};
//! use porta_core::grpc::ChannelInvoker;
//! use std::sync::Arc;
//!
//! # async fn run(method: porta_core::prost_reflect::MethodDescriptor) -> Result<(), Box<dyn std::error::Error>> {
//! let invoker = Arc::new(ChannelInvoker::connect("http://localhost:50051").await?);
//! let mux = ServeMux::builder(invoker)
//!     .handle(Binding::new(http::Method::POST, "/v1/echo/{id}", method)?.body("*"))
//!     .build();
//! Gateway::new(mux).serve("127.0.0.1:8080".parse()?).await?;
//! # Ok(())
//! # }
//! ```

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::{StreamExt, TryStreamExt};
use std::net::SocketAddr;
use std::sync::Arc;

pub use porta_core::handler::Binding;
pub use porta_core::mux::{ServeMux, ServeMuxBuilder};

/// The gateway frontend: an axum application around the dispatcher.
#[derive(Clone)]
pub struct Gateway {
    mux: Arc<ServeMux>,
}

impl Gateway {
    pub fn new(mux: ServeMux) -> Self {
        Self { mux: Arc::new(mux) }
    }

    /// Builds the axum router. Every path falls through to the dispatcher,
    /// which owns routing; tower layers can be stacked on the result.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(self.mux.clone())
    }

    /// Binds a listener and serves until the process is stopped.
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("gateway listening on {addr}");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

/// The single axum handler: hand the raw request to the dispatcher and
/// convert its response body back into an axum body.
async fn handle(State(mux): State<Arc<ServeMux>>, request: http::Request<Body>) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (parts, body) = request.into_parts();
    let stream = body
        .into_data_stream()
        .map_err(|err| Box::new(err) as porta_core::BoxError)
        .boxed();
    let response = mux.dispatch(parts, stream, remote_addr).await;
    response.map(Body::new)
}
