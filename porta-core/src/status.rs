//! # Status Mapper
//!
//! Conversions between gRPC status codes and HTTP response statuses, plus
//! the structured JSON error body written on every failure path.
//!
//! The forward table follows the canonical transcoding mapping, with one
//! deliberate exception: `CANCELLED` surfaces as the de-facto `499 Client
//! Closed Request` rather than `408`.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tonic::{Code, Status};

/// `499 Client Closed Request`, absent from [`http::StatusCode`] constants.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Maps a gRPC status code to the HTTP response status.
pub fn http_status_from_code(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => client_closed_request(),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        // Deliberately not the similarly named '412 Precondition Failed'.
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

/// Maps an HTTP status back to a gRPC code.
///
/// The inverse is only stable where the forward mapping is unambiguous; for
/// statuses produced by several codes the most general code is chosen, and
/// unmapped statuses fall back to `UNKNOWN`.
pub fn code_from_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        200 => Code::Ok,
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        500 => Code::Internal,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}

/// The structured JSON body written for every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// The numeric gRPC code.
    pub code: i32,
    /// The status message.
    pub message: String,
    /// Opaque structured detail values, passed through untouched.
    pub details: Vec<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Builds the body for a backend status, passing details through.
    pub fn from_status(status: &Status) -> Self {
        Self::new(status.code(), status.message())
    }

    /// Serializes the body, falling back to a fixed `INTERNAL` payload if
    /// serialization itself fails.
    pub fn to_bytes(&self) -> bytes::Bytes {
        const FALLBACK: &str = r#"{"code":13,"message":"failed to marshal error message","details":[]}"#;
        match serde_json::to_vec(self) {
            Ok(buf) => bytes::Bytes::from(buf),
            Err(err) => {
                tracing::warn!("failed to marshal error body: {err}");
                bytes::Bytes::from_static(FALLBACK.as_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_table_is_total() {
        let codes = [
            (Code::Ok, 200),
            (Code::Cancelled, 499),
            (Code::Unknown, 500),
            (Code::InvalidArgument, 400),
            (Code::DeadlineExceeded, 504),
            (Code::NotFound, 404),
            (Code::AlreadyExists, 409),
            (Code::PermissionDenied, 403),
            (Code::ResourceExhausted, 429),
            (Code::FailedPrecondition, 400),
            (Code::Aborted, 409),
            (Code::OutOfRange, 400),
            (Code::Unimplemented, 501),
            (Code::Internal, 500),
            (Code::Unavailable, 503),
            (Code::DataLoss, 500),
            (Code::Unauthenticated, 401),
        ];
        for (code, http) in codes {
            assert_eq!(http_status_from_code(code).as_u16(), http, "{code:?}");
        }
    }

    #[test]
    fn inverse_is_stable_on_forward_image() {
        // Every status in the forward image maps back to a code whose
        // forward mapping yields the same status.
        for http in [200u16, 400, 401, 403, 404, 409, 429, 499, 500, 501, 503, 504] {
            let status = StatusCode::from_u16(http).unwrap();
            let code = code_from_http_status(status);
            assert_eq!(http_status_from_code(code), status);
        }
    }

    #[test]
    fn error_body_shape() {
        let body = ErrorBody::from_status(&Status::not_found("not found"));
        let json: serde_json::Value = serde_json::from_slice(&body.to_bytes()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 5, "message": "not found", "details": []})
        );
    }
}
