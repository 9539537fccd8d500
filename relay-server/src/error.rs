//! Maps the component-specific error types the webhook/WebSocket handlers
//! depend on onto the workspace's unified [`relay_common::error::Error`]
//! taxonomy (spec §7), mirroring `relay_pipeline::error`.

pub use relay_common::error::{Error, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub fn from_store(e: relay_store::StoreError) -> Error {
    match e {
        relay_store::StoreError::NotFound(m) => Error::NotFound(m),
        relay_store::StoreError::Validation(m) => Error::Validation(m),
        relay_store::StoreError::Backend(m) => Error::Internal(m),
    }
}

pub fn from_route(e: relay_router::RouteError) -> Error {
    match e {
        relay_router::RouteError::Validation(m) => Error::Validation(m),
        relay_router::RouteError::LockTimeout => Error::LockTimeout("router lock".into()),
        relay_router::RouteError::Lock(inner) => Error::Internal(inner.to_string()),
        relay_router::RouteError::Store(inner) => from_store(inner),
    }
}

pub fn from_orchestrator(e: relay_orchestrator::OrchestratorError) -> Error {
    let relay_orchestrator::OrchestratorError::Backend(m) = e;
    Error::Internal(m)
}

/// Wraps [`Error`] so handlers can `?`-propagate it straight into an axum
/// response: `{success: false, reason}` with the mapped status code (spec
/// §6 "Any non-2xx response ... returned as `{success: false, reason}`").
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.0.is_expected() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "success": false, "reason": self.0.to_string() }))).into_response()
    }
}
