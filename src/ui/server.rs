//! HTTP server: listener stream, controller API and browser assets

use axum::{
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::playback::Engine;
use crate::ui::assets::AssetStore;
use crate::ui::handlers;

/// Shared handler state
pub struct AppState {
    pub engine: Engine,
    pub assets: AssetStore,
}

/// Web server
pub struct WebServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig, engine: Engine, assets: AssetStore) -> Self {
        Self {
            config,
            state: Arc::new(AppState { engine, assets }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Address the server binds to
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))
    }

    /// Serve until the listener fails
    pub async fn serve(self) -> Result<()> {
        let addr = self.addr()?;
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web UI listening on http://{}", addr);

        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start server in background
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/home", get(handlers::home_page))
        .route(
            "/controller",
            get(handlers::controller_page).post(handlers::run_command),
        )
        .route("/stream", get(handlers::stream_audio))
        .route("/status", get(handlers::get_status))
        .fallback(handlers::static_asset)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
