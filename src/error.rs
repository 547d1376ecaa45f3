//! Error codes and plain-text error responses for the proxy

use crate::directory::ResolveError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No host could be determined for the request
    MissingHostHeader,
    /// No directory entry matches the host
    TenantNotFound,
    /// The tenant store failed during lookup
    DirectoryUnavailable,
    /// Default backend URL or computed target is invalid
    BackendConfigError,
    /// Failed to reach the backend
    UpstreamUnavailable,
    /// Backend did not answer within the request timeout
    UpstreamTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::TenantNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::DirectoryUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BackendConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::TenantNotFound => "TENANT_NOT_FOUND",
            ProxyErrorCode::DirectoryUnavailable => "DIRECTORY_UNAVAILABLE",
            ProxyErrorCode::BackendConfigError => "BACKEND_CONFIG_ERROR",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ResolveError> for ProxyErrorCode {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::NotFound(_) => ProxyErrorCode::TenantNotFound,
            ResolveError::Directory(_) => ProxyErrorCode::DirectoryUnavailable,
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
