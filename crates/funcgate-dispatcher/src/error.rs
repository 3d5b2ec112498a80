use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;

/// Failure causes of the dispatch, async and pickup paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// Wrong method, missing callback header, unreadable body. No remote call was made.
    InvalidRequest,
    ScheduleNotFound,
    TaskSpawnFailed,
    UpstreamTimeout,
    ForwardingFailed,
    CacheMiss,
    CorruptEntry,
}

impl DispatchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchErrorKind::InvalidRequest => "invalid_request",
            DispatchErrorKind::ScheduleNotFound => "schedule_not_found",
            DispatchErrorKind::TaskSpawnFailed => "task_spawn_failed",
            DispatchErrorKind::UpstreamTimeout => "upstream_timeout",
            DispatchErrorKind::ForwardingFailed => "forwarding_failed",
            DispatchErrorKind::CacheMiss => "cache_miss",
            DispatchErrorKind::CorruptEntry => "corrupt_entry",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            DispatchErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            DispatchErrorKind::ScheduleNotFound
            | DispatchErrorKind::TaskSpawnFailed
            | DispatchErrorKind::ForwardingFailed => StatusCode::BAD_GATEWAY,
            DispatchErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchErrorKind::CacheMiss | DispatchErrorKind::CorruptEntry => StatusCode::NOT_FOUND,
        }
    }

    fn message(self) -> &'static str {
        match self {
            DispatchErrorKind::InvalidRequest => "invalid request",
            DispatchErrorKind::ScheduleNotFound => "no matching schedule",
            DispatchErrorKind::TaskSpawnFailed => "failed to spawn task",
            DispatchErrorKind::UpstreamTimeout => "upstream failed to connect in time",
            DispatchErrorKind::ForwardingFailed => "upstream request failed",
            DispatchErrorKind::CacheMiss | DispatchErrorKind::CorruptEntry => {
                "request data not found"
            }
        }
    }
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct DispatchError {
    kind: DispatchErrorKind,
    inner: anyhow::Error,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, inner: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            inner: inner.into(),
        }
    }

    pub fn invalid(message: &'static str) -> Self {
        Self::new(DispatchErrorKind::InvalidRequest, anyhow::anyhow!(message))
    }

    pub fn kind(&self) -> DispatchErrorKind {
        self.kind
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.kind, self.inner)
    }
}

impl std::error::Error for DispatchError {}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        tracing::warn!(
            event = "funcgate.dispatch.error",
            kind = %self.kind,
            error = %format!("{:#}", self.inner),
            "request failed"
        );
        let message = match self.kind {
            // Validation messages are safe and useful to return to the caller.
            DispatchErrorKind::InvalidRequest => self.inner.to_string(),
            kind => kind.message().to_string(),
        };
        ApiError {
            status: self.kind.status(),
            message,
        }
        .into_response()
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
