//! Error handling.

use crate::engine::EngineError;
use crate::role::Role;

use axum::{
    extract::rejection::QueryRejection,
    http::header,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

/// siibra-api request error type
///
/// This type encapsulates the various errors that may occur while serving a request or running a
/// task. Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Entity lookup failed
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// Operation arguments could not be deserialised
    #[error("invalid arguments for {operation}")]
    InvalidArguments {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    /// Error deserialising query parameters
    #[error("query parameters are not valid")]
    QueryRejection(#[from] QueryRejection),

    /// Error validating query parameters
    #[error("query parameters are not valid")]
    QueryValidation(#[from] validator::ValidationErrors),

    /// The atlas engine could not reach one of its data sources
    #[error("atlas engine temporarily unavailable: {0}")]
    EngineUnavailable(String),

    /// A queued task did not finish in time and was revoked
    #[error("task {task_id} did not finish within {seconds} seconds")]
    TaskTimeout { task_id: String, seconds: u64 },

    /// A queued task reported failure
    #[error("{message}")]
    TaskFailed {
        task_id: String,
        status: u16,
        message: String,
    },

    /// No operation is registered under the name
    #[error("no operation registered as {0}")]
    UnknownOperation(String),

    /// Operation has no dispatcher in this process role
    #[error("operation {operation} cannot be dispatched in the {role} role")]
    NotDispatchable { operation: String, role: Role },

    /// Source code of an operation could not be located
    #[error("source code of {0} is not available")]
    SourceUnavailable(String),

    /// Error talking to the task queue
    #[error("task queue error")]
    Queue(#[from] redis::RedisError),

    /// Error (de)serialising JSON
    #[error("failed to (de)serialise JSON")]
    Serialization(#[from] serde_json::Error),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// An in-process task was cancelled or panicked
    #[error("task execution aborted")]
    Join(#[from] tokio::task::JoinError),

    /// The route exists but not for this method
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// The request did not complete in time
    #[error("request timed out")]
    RequestTimeout,

    /// Unexpected failure
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status of the response for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            // Bad request
            Self::InvalidArguments { .. } | Self::QueryRejection(_) | Self::QueryValidation(_) => {
                StatusCode::BAD_REQUEST
            }

            // Not found
            Self::NotFound { .. } | Self::UnknownOperation(_) | Self::SourceUnavailable(_) => {
                StatusCode::NOT_FOUND
            }

            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,

            // Retry later
            Self::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            // Timeouts
            Self::TaskTimeout { .. } | Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,

            // Whatever the worker decided
            Self::TaskFailed { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }

            // Internal server error
            Self::NotDispatchable { .. }
            | Self::Queue(_)
            | Self::Serialization(_)
            | Self::SemaphoreAcquireError(_)
            | Self::Join(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotFound { kind, id } => Self::NotFound {
                kind: kind.to_string(),
                id,
            },
            EngineError::Unavailable(reason) => Self::EngineUnavailable(reason),
        }
    }
}

impl IntoResponse for ApiError {
    /// Convert from an `ApiError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorEnvelope::from(self).into_response()
    }
}

/// Startup error type
///
/// These errors describe a deployment misconfiguration. They are fatal and are never turned into
/// HTTP responses.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Two dispatch targets share a name
    #[error("operation {0} is already registered")]
    DuplicateRegistration(String),

    /// Fire-and-poll dispatch needs a task queue
    #[error("operation {0} cannot be queued asynchronously in the all role")]
    QueueAsAsyncInAllRole(String),

    /// Cooperative dispatch needs a cooperative body
    #[error("operation {0} must be cooperative to use the cooperative dispatcher")]
    NotCooperative(String),

    /// The role needs a task queue but none was configured
    #[error("the {0} role requires a task queue")]
    MissingTaskQueue(Role),

    /// A task queue was configured for a role that must not use one
    #[error("a task queue must not be configured in the {0} role")]
    UnexpectedTaskQueue(Role),

    /// The task queue could not be reached
    #[error("failed to connect to the task queue at {url}: {reason}")]
    QueueUnavailable { url: String, reason: String },
}

/// JSON body of every error response
///
/// Cached error responses are replayed with `status_code` as their HTTP status.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    /// Always true; distinguishes error payloads from data
    pub error: bool,

    /// HTTP status of the response
    pub status_code: u16,

    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl ErrorEnvelope {
    /// Return a new ErrorEnvelope
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred
    pub fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorEnvelope {
            error: true,
            status_code: status.as_u16(),
            message,
            caused_by,
        }
    }

    /// HTTP status of this envelope.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<&ApiError> for ErrorEnvelope {
    fn from(error: &ApiError) -> Self {
        Self::new(error.status(), error)
    }
}

impl From<ApiError> for ErrorEnvelope {
    /// Convert from an `ApiError` into an `ErrorEnvelope`, logging server errors.
    fn from(error: ApiError) -> Self {
        let envelope = Self::from(&error);

        if envelope.status().is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        envelope
    }
}

impl IntoResponse for ErrorEnvelope {
    /// Convert from an `ErrorEnvelope` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        match serde_json::to_string(&self) {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status(),
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
