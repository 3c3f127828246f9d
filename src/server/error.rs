use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::server::notify::NotifyError;
use crate::server::range::RangeError;
use crate::server::template::TemplateError;

/// Error returned by HTTP handlers.
///
/// 5xx errors are logged with their source chain and structured context when
/// turned into a response; the client only sees `{"error": message}`.
///
/// ```rust,ignore
/// use crate::server::error::ServerErrorExt;
///
/// let slice = read_log(&path, &query)
///     .await
///     .internal_err("Failed to read range logs")?;
/// ```
#[derive(Debug)]
pub struct ServerError {
    /// HTTP status code to return
    pub status: StatusCode,
    /// User-facing error message (returned in response)
    pub message: String,
    /// Internal error with full chain (logged but not exposed to client)
    pub source: Option<anyhow::Error>,
    /// Structured context for logging (key-value pairs)
    pub context: Vec<(&'static str, String)>,
}

impl ServerError {
    /// Create a new error with just status and message (no source error)
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            context: Vec::new(),
        }
    }

    /// Create an error from an anyhow::Error with full error chain
    pub fn from_anyhow(
        source: anyhow::Error,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            source: Some(source),
            context: Vec::new(),
        }
    }

    /// Add a context field for logging (chainable)
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Create a 500 Internal Server Error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 500 Internal Server Error from an anyhow::Error
    pub fn internal_anyhow(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(source, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 401 Unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// Create a 404 Not Found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Create a 409 Conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Log server errors (5xx) with full context using structured fields
        if self.status.is_server_error() {
            // Log with structured fields to prevent log injection
            if let Some(source) = &self.source {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    error = ?source,
                    "Server error"
                );
            } else {
                tracing::error!(
                    status = self.status.as_u16(),
                    message = %self.message,
                    context = ?self.context,
                    "Server error"
                );
            }
        }

        // Return clean JSON error response to client
        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_anyhow(err, "Internal server error")
    }
}

impl From<NotifyError> for ServerError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::Config { .. } => Self::bad_request(err.to_string()),
            NotifyError::Delivery(_) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

impl From<RangeError> for ServerError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::UnknownTag(_) | RangeError::UnknownRole { .. } => {
                Self::bad_request(err.to_string())
            }
            RangeError::RangeNotFound(_) => Self::not_found(err.to_string()),
            RangeError::AlreadyDeploying | RangeError::TestingEnabled => {
                Self::conflict(err.to_string())
            }
            RangeError::MissingCredentials(ref username) => {
                let username = username.clone();
                Self::internal(err.to_string()).with_context("username", username)
            }
            RangeError::NoPlaybookProcess(_) => Self::internal(err.to_string()),
            RangeError::Notification(e) => e.into(),
            RangeError::Storage(e) => Self::internal_anyhow(e, "Range storage failed"),
        }
    }
}

impl From<TemplateError> for ServerError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::UnknownTemplate(_) => Self::not_found(err.to_string()),
            TemplateError::MissingCredentials(ref username) => {
                let username = username.clone();
                Self::internal(err.to_string()).with_context("username", username)
            }
            TemplateError::NoBuildProcess(_) => Self::internal(err.to_string()),
            TemplateError::Signal(e) => {
                Self::internal_anyhow(e.into(), "Failed to signal build abort")
            }
            TemplateError::Inventory(e) => {
                Self::internal_anyhow(e, "Failed to list templates")
            }
        }
    }
}

/// Converts any `Into<anyhow::Error>` result into a `ServerError` result
pub trait ServerErrorExt<T> {
    /// Convert error to internal server error (500)
    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError>;
}

impl<T, E> ServerErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn internal_err(self, message: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::internal_anyhow(e.into(), message))
    }
}
