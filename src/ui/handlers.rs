//! HTTP API handlers

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;

use crate::broadcast::registry::RegistryStats;
use crate::control::{self, Command, CommandOutcome};
use crate::playback::EngineStatus;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Control request body
#[derive(serde::Deserialize)]
pub struct ControlRequest {
    pub command: String,
}

/// Broadcast status
#[derive(serde::Serialize)]
pub struct StatusReport {
    pub playback: EngineStatus,
    pub listeners: RegistryStats,
    pub effects: Vec<String>,
}

/// Join the broadcast: an endless `audio/mpeg` body fed by a new listener
pub async fn stream_audio(State(state): State<Arc<AppState>>) -> Response {
    let (id, listener) = state.engine.registry().register();
    tracing::debug!("streaming to listener {}", id);

    // Dropping the body drops the listener, which deregisters it.
    let body = Body::from_stream(listener.map(Ok::<_, Infallible>));

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Run a text control command
pub async fn run_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ControlRequest>,
) -> (StatusCode, Json<ApiResponse<CommandOutcome>>) {
    let outcome = control::dispatch(&state.engine, Command::parse(&req.command)).await;

    if outcome.ok {
        (StatusCode::OK, Json(ApiResponse::ok(outcome)))
    } else {
        (StatusCode::BAD_REQUEST, Json(ApiResponse::error(outcome.message)))
    }
}

/// Get broadcast status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<StatusReport>> {
    let effects = match state.engine.effects().list().await {
        Ok(effects) => effects,
        Err(e) => {
            tracing::warn!("cannot list effects: {}", e);
            Vec::new()
        }
    };

    Json(ApiResponse::ok(StatusReport {
        playback: state.engine.status(),
        listeners: state.engine.registry().stats(),
        effects,
    }))
}

pub async fn root() -> Redirect {
    Redirect::to("/home")
}

/// Listener page
pub async fn home_page(State(state): State<Arc<AppState>>) -> Response {
    serve_asset(&state, "/home/").await
}

/// Controller page
pub async fn controller_page(State(state): State<Arc<AppState>>) -> Response {
    serve_asset(&state, "/controller/").await
}

/// Any other path: a file under the public directory
pub async fn static_asset(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    serve_asset(&state, uri.path()).await
}

async fn serve_asset(state: &AppState, path: &str) -> Response {
    match state.assets.open(path).await {
        Ok(asset) => (
            [
                (header::CONTENT_TYPE, asset.content_type),
                (header::CONTENT_LENGTH, asset.len.to_string()),
            ],
            asset.body,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e) => {
            tracing::error!("cannot serve {}: {}", path, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
