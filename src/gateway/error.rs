//! Hand-written error types for the two layers that need one: the
//! subprocess connection (`AgentProcessError`) and the HTTP orchestrator
//! (`GatewayError`, which maps onto a status code).

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::gateway::models::ErrorDetail;

/// Failure modes surfaced by an [`crate::gateway::agent_connection::AgentConnection`].
#[derive(Debug, Clone)]
pub enum AgentProcessError {
    /// The subprocess could not be spawned at all.
    SpawnFailed(String),
    /// The subprocess exited (or its stdout closed) while a request was
    /// outstanding. Carries a tail of captured stderr for diagnostics.
    Crashed { stderr_tail: String },
    /// A response frame didn't parse as JSON-RPC, or carried a mismatched id.
    Protocol(String),
    /// The remote side returned a JSON-RPC error object.
    Remote { code: i64, message: String },
    /// The prompt in flight was cancelled before the agent replied.
    Cancelled(String),
}

impl fmt::Display for AgentProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentProcessError::SpawnFailed(msg) => write!(f, "failed to spawn agent process: {msg}"),
            AgentProcessError::Crashed { stderr_tail } => {
                write!(f, "agent process exited unexpectedly, stderr: {stderr_tail}")
            }
            AgentProcessError::Protocol(msg) => write!(f, "agent protocol error: {msg}"),
            AgentProcessError::Remote { code, message } => {
                write!(f, "agent returned error {code}: {message}")
            }
            AgentProcessError::Cancelled(msg) => write!(f, "prompt cancelled: {msg}"),
        }
    }
}

impl std::error::Error for AgentProcessError {}

/// Orchestrator-level error, one variant per HTTP failure mode the Run
/// API surface can produce.
#[derive(Debug, Clone)]
pub enum GatewayError {
    AgentNotFound(String),
    RunNotFound(String),
    SessionNotFound(String),
    InvalidRequest(String),
    Unauthorized,
    Upstream(AgentProcessError),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AgentNotFound(name) => write!(f, "unknown agent: {name}"),
            GatewayError::RunNotFound(id) => write!(f, "unknown run: {id}"),
            GatewayError::SessionNotFound(id) => write!(f, "unknown session: {id}"),
            GatewayError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            GatewayError::Unauthorized => write!(f, "unauthorized"),
            GatewayError::Upstream(err) => write!(f, "agent failure: {err}"),
            GatewayError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<AgentProcessError> for GatewayError {
    fn from(err: AgentProcessError) -> Self {
        GatewayError::Upstream(err)
    }
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RunNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::AgentNotFound(_) => "agent_not_found",
            GatewayError::RunNotFound(_) => "run_not_found",
            GatewayError::SessionNotFound(_) => "session_not_found",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Upstream(_) => "agent_failure",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
            data: None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self.detail())).into_response()
    }
}
