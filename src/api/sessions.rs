//! Session REST endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;

use super::ApiState;
use crate::Error;
use crate::session::{AgentDescriptor, CreateSession};

/// Build the session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}", delete(destroy_session))
        .with_state(state)
}

/// Create a session and return its agent descriptor
async fn create_session(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateSession>,
) -> Result<Json<AgentDescriptor>, SessionError> {
    let descriptor = state.registry.create(request).await?;
    Ok(Json(descriptor))
}

/// Look up a session's current descriptor
async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Result<Json<AgentDescriptor>, SessionError> {
    let descriptor = state.registry.descriptor(&session_id).await?;
    Ok(Json(descriptor))
}

/// Tear down a session
async fn destroy_session(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.registry.unload(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Session API error envelope
#[derive(Debug)]
pub struct SessionError(Error);

impl From<Error> for SessionError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code) = match &self.0 {
            Error::Config(_) => (StatusCode::BAD_REQUEST, "configuration_error"),
            Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            Error::SessionExists(_) => (StatusCode::CONFLICT, "session_exists"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code,
                    message: self.0.to_string(),
                },
            }),
        )
            .into_response()
    }
}
