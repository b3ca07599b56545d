//! Error taxonomy for the registry and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the registry, resolver and certificate lifecycle
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A record with this name already exists
    #[error("domain {0} is already registered")]
    DuplicateDomain(String),

    /// Neither an exact nor a wildcard record matches the hostname
    #[error("no registry entry matches {0}")]
    NotConfigured(String),

    /// The record targeted by a mutation does not exist
    #[error("domain {0} not found")]
    NotFound(String),

    /// A subdomain references a parent that is not registered
    #[error("parent domain {0} not found")]
    ParentNotFound(String),

    /// Malformed input, rejected before any write
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Filesystem or process operation needs elevated privileges
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// External tool exited unsuccessfully
    #[error("`{command}` failed ({status}):\n{output}")]
    ToolExecution {
        command: String,
        status: String,
        output: String,
    },

    /// DNS challenge record did not become visible in time
    #[error("TXT record {record} not visible after {attempts} attempts")]
    PropagationTimeout { record: String, attempts: u32 },

    /// Another issuance for this domain has not finished
    #[error("certificate issuance already in progress for {0}")]
    IssuanceInProgress(String),

    /// The record changed since the caller last read it
    #[error("domain {domain} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        domain: String,
        expected: i64,
        found: i64,
    },

    /// The default listener certificate could not be produced
    #[error("default certificate bootstrap failed: {0}")]
    SelfSignedBootstrap(#[source] Box<RegistryError>),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Whether the operator can reasonably retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::PropagationTimeout { .. } | RegistryError::Conflict { .. }
        )
    }

    /// Map an I/O error, surfacing permission failures as their own variant
    pub fn from_io(err: std::io::Error, context: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            RegistryError::PermissionDenied(format!("{}: {}", context, err))
        } else {
            RegistryError::Io(err)
        }
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Hostname has no registry entry
    UnknownHost,
    /// Static site has neither the file nor an index document
    StaticNotFound,
    /// Method not allowed on a static site
    MethodNotAllowed,
    /// Request timed out waiting for the upstream
    RequestTimeout,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::StaticNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::StaticNotFound => "STATIC_NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
