//! # Error Handling
//!
//! Every fallible operation in the data plane returns a [`GatewayResult`]. The error enum is built
//! with `thiserror` so each variant carries its own display message, and it implements axum's
//! `IntoResponse` so request-time failures turn into structured JSON bodies instead of panics.
//!
//! ## Error categories
//!
//! - **Transient** failures (a malformed event, one route failing to build, one plugin failing
//!   validation) are logged by the caller and skipped.
//! - **Build-time fatal** failures (store file cannot be opened, invalid settings) bubble up to
//!   `main` and stop the process.
//! - **Request-time** failures map onto gateway status codes: `502` for a generic upstream failure,
//!   `504` for an upstream timeout and `499` when the client went away first.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Non-standard status used when the client closed the connection before the upstream answered
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Error types for the data plane
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid settings or resource definitions
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Durable store could not be read or written
    #[error("Store error: {message}")]
    Store { message: String },

    /// A stored value could not be decoded into its resource type
    #[error("Failed to decode {kind} '{id}': {message}")]
    Decode {
        kind: String,
        id: String,
        message: String,
    },

    /// A looked-up resource does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// A route URI uses syntax the routing table cannot express
    #[error("Unsupported uri pattern: {uri}")]
    UnsupportedPattern { uri: String },

    /// Plugin construction, initialisation or execution failed
    #[error("Plugin error ({plugin}): {message}")]
    Plugin { plugin: String, message: String },

    /// A plugin config did not satisfy the plugin's JSON schema
    #[error("Schema validation failed for plugin {plugin}: {message}")]
    SchemaValidation { plugin: String, message: String },

    /// No route matched the inbound request
    #[error("No route found for {method} {path}")]
    RouteNotFound { method: String, path: String },


    /// The upstream could not be reached or answered with a broken exchange
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    /// The upstream exchange took longer than its deadline
    #[error("Upstream timeout after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    /// The inbound client disconnected before the exchange finished
    #[error("Client closed request: {message}")]
    ClientClosed { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn decode<K: Into<String>, I: Into<String>, M: ToString>(kind: K, id: I, err: M) -> Self {
        Self::Decode {
            kind: kind.into(),
            id: id.into(),
            message: err.to_string(),
        }
    }

    pub fn not_found<K: Into<String>, I: Into<String>>(kind: K, id: I) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a plugin error attributed to the named plugin
    pub fn plugin<P: Into<String>, M: Into<String>>(plugin: P, message: M) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn upstream<S: Into<String>>(message: S) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check whether this error means the resource simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Get the HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // 499 is a valid u16 status, from_u16 only fails outside 100..=999
            Self::ClientClosed { .. } => StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::BAD_REQUEST),
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Store { .. }
            | Self::Decode { .. }
            | Self::UnsupportedPattern { .. }
            | Self::Plugin { .. }
            | Self::SchemaValidation { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Store { .. } => "store_error",
            Self::Decode { .. } => "decode_error",
            Self::NotFound { .. } => "not_found",
            Self::UnsupportedPattern { .. } => "unsupported_pattern",
            Self::Plugin { .. } => "plugin_error",
            Self::SchemaValidation { .. } => "schema_validation_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::ClientClosed { .. } => "client_closed_request",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Render the error as a structured JSON body with the mapped status code
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

/// Convenience macro for creating internal errors
///
/// Usage: `internal_error!("Failed to process request: {}", request_id)`
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::internal(format!($($arg)*))
    };
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
