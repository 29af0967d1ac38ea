//! HTTP server: stream endpoint plus status and config API

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::error::{NetworkError, Result};
use crate::http::handlers;
use crate::pipeline::AudioPipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AudioPipeline>,
}

/// Build the router
pub fn router(pipeline: Arc<AudioPipeline>) -> Router {
    Router::new()
        .route("/", get(handlers::banner))
        .route("/stream.opus", get(handlers::stream_opus))
        .route("/api/status", get(handlers::get_status))
        .route(
            "/api/config",
            get(handlers::get_config).post(handlers::update_config),
        )
        .layer(CorsLayer::permissive())
        .with_state(AppState { pipeline })
}

/// HTTP listener bound from the config at startup
pub struct WebServer {
    pipeline: Arc<AudioPipeline>,
}

impl WebServer {
    pub fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self { pipeline }
    }

    /// Serve until the pipeline shuts down
    pub async fn run(self) -> Result<()> {
        let config = self.pipeline.config().snapshot();
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP server listening on http://{}", listener.local_addr()?);

        let mut shutdown = self.pipeline.shutdown_signal();
        axum::serve(listener, router(self.pipeline))
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
