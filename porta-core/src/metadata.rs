//! # Metadata Bridge
//!
//! Translates HTTP headers to gRPC metadata on the way in and back out.
//!
//! Inbound, `Grpc-Metadata-*` headers become metadata pairs under their
//! stripped, lowercased names, `Grpc-Timeout` becomes the call deadline,
//! and the forwarding headers (`X-Forwarded-Host`/`X-Forwarded-For`) are
//! propagated. Sensitive request headers are never forwarded unless they
//! are named in the allow-list. Outbound, server metadata and trailers are
//! written back as `Grpc-Metadata-*` and `Grpc-Trailer-*` headers.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};

const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";
const METADATA_TRAILER_PREFIX: &str = "grpc-trailer-";
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Errors raised while bridging request headers.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("malformed Grpc-Timeout value '{0}'")]
    MalformedTimeout(String),
}

/// A hook that may inject or rewrite outgoing metadata before invocation.
pub type MetadataAnnotator = Arc<dyn Fn(&Parts, &mut MetadataMap) + Send + Sync>;

/// Header→metadata translation, configured once at mux build time.
#[derive(Clone, Default)]
pub struct MetadataBridge {
    /// Lowercased names of request headers that forward as metadata.
    allow_list: Vec<String>,
    annotators: Vec<MetadataAnnotator>,
    /// Applied when the request carries no `Grpc-Timeout` header.
    default_timeout: Option<Duration>,
}

impl MetadataBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows a request header (by name) to forward as metadata under its
    /// lowercased name.
    pub fn allow_header(&mut self, name: &str) {
        self.allow_list.push(name.to_ascii_lowercase());
    }

    /// Registers an annotator hook; hooks run before invocation, in
    /// registration order.
    pub fn add_annotator(&mut self, annotator: MetadataAnnotator) {
        self.annotators.push(annotator);
    }

    /// Sets the server-default timeout used when the request carries none.
    pub fn set_default_timeout(&mut self, timeout: Option<Duration>) {
        self.default_timeout = timeout;
    }

    /// Builds the outgoing metadata and deadline for a request.
    ///
    /// `remote_addr` extends `X-Forwarded-For` when known.
    pub fn annotate(
        &self,
        parts: &Parts,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(MetadataMap, Option<Duration>), MetadataError> {
        let mut metadata = MetadataMap::new();

        let mut timeout = self.default_timeout;
        if let Some(value) = parts.headers.get(GRPC_TIMEOUT_HEADER) {
            let text = value
                .to_str()
                .map_err(|_| MetadataError::MalformedTimeout(String::new()))?;
            timeout = Some(parse_grpc_timeout(text)?);
        }

        for (name, value) in parts.headers.iter() {
            let name = name.as_str();
            let forwarded_key = if let Some(stripped) = name.strip_prefix(METADATA_HEADER_PREFIX) {
                Some(stripped.to_string())
            } else if self.allow_list.iter().any(|allowed| allowed == name) {
                Some(name.to_string())
            } else {
                None
            };
            let Some(key) = forwarded_key else { continue };
            insert_pair(&mut metadata, &key, value);
        }

        // Forwarding headers mirror what a proxy in front of us would do.
        match parts.headers.get(X_FORWARDED_HOST) {
            Some(host) => insert_pair(&mut metadata, X_FORWARDED_HOST, host),
            None => {
                if let Some(host) = parts.headers.get(http::header::HOST) {
                    insert_pair(&mut metadata, X_FORWARDED_HOST, host);
                }
            }
        }
        if let Some(addr) = remote_addr {
            let peer = addr.ip().to_string();
            let combined = match parts.headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, {peer}"),
                None => peer,
            };
            if let Ok(value) = MetadataValue::from_str(&combined) {
                if let Ok(key) = MetadataKey::from_str(X_FORWARDED_FOR) {
                    metadata.insert(key, value);
                }
            }
        }

        for annotator in &self.annotators {
            annotator(parts, &mut metadata);
        }

        Ok((metadata, timeout))
    }
}

fn insert_pair(metadata: &mut MetadataMap, key: &str, value: &HeaderValue) {
    let Ok(key) = MetadataKey::from_str(&key.to_ascii_lowercase()) else {
        tracing::debug!("skipping invalid metadata key '{key}'");
        return;
    };
    let Ok(text) = value.to_str() else {
        tracing::debug!("skipping non-ascii metadata value for '{key}'");
        return;
    };
    let Ok(value) = MetadataValue::from_str(text) else {
        return;
    };
    metadata.append(key, value);
}

/// Parses a `Grpc-Timeout` header value: a decimal integer followed by a
/// one-letter unit, per the gRPC wire spec.
pub fn parse_grpc_timeout(text: &str) -> Result<Duration, MetadataError> {
    let malformed = || MetadataError::MalformedTimeout(text.to_string());
    if text.len() < 2 {
        return Err(malformed());
    }
    let (digits, unit) = text.split_at(text.len() - 1);
    let amount: u64 = digits.parse().map_err(|_| malformed())?;
    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(malformed)?),
        "M" => Duration::from_secs(amount.checked_mul(60).ok_or_else(malformed)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return Err(malformed()),
    };
    Ok(duration)
}

/// Writes server metadata into response headers under `prefix`.
///
/// Binary (`-bin`) metadata is skipped; its base64 form is not portable
/// through arbitrary HTTP intermediaries.
pub fn append_metadata_headers(headers: &mut HeaderMap, metadata: &MetadataMap, prefix: &str) {
    for entry in metadata.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            tracing::debug!("skipping binary metadata in HTTP response");
            continue;
        };
        let Ok(name) = HeaderName::from_str(&format!("{prefix}{}", key.as_str())) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) else {
            continue;
        };
        headers.append(name, value);
    }
}

/// Writes trailer metadata as `Grpc-Trailer-*` entries into `headers`.
pub fn trailer_header_map(metadata: &MetadataMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    append_metadata_headers(&mut headers, metadata, METADATA_TRAILER_PREFIX);
    headers
}

/// The `Trailer` declaration names for a trailer metadata map.
pub fn trailer_names(metadata: &MetadataMap) -> Vec<String> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, _) => {
                Some(format!("{METADATA_TRAILER_PREFIX}{}", key.as_str()))
            }
            KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

/// Whether the client negotiated HTTP trailers (`TE: trailers`).
pub fn wants_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("trailers")))
}

/// The response-metadata header prefix.
pub const RESPONSE_METADATA_PREFIX: &str = "grpc-metadata-";
