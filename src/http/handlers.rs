//! HTTP handlers

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{ConfigUpdate, ServerConfig};
use crate::constants::HTTP_RING_MS;
use crate::http::server::AppState;
use crate::http::stream::stream_ogg;
use crate::pipeline::{Admission, PipelineStatus, Transport};

pub const OGG_CONTENT_TYPE: &str = "application/ogg; codecs=opus";

/// Chunks buffered between the encoder task and the response body
const BODY_CHANNEL_DEPTH: usize = 8;

/// API response wrapper
#[derive(Serialize)]
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

/// Sender status
#[derive(Serialize)]
pub struct SenderStatus {
    #[serde(flatten)]
    pub pipeline: PipelineStatus,
    pub name: String,
    pub http_port: u16,
    pub pcm_port: u16,
}

/// Plain-text banner
pub async fn banner(State(state): State<AppState>) -> String {
    let config = state.pipeline.config().snapshot();
    format!(
        "{} {}\nGET /stream.opus  Ogg/Opus {} kbps, {} ms frames\nTCP {}  raw PCM 48 kHz stereo s16le\n",
        crate::constants::VENDOR,
        env!("CARGO_PKG_VERSION"),
        config.bitrate / 1000,
        config.frame_ms,
        config.pcm_port
    )
}

/// Live Ogg/Opus stream
pub async fn stream_opus(State(state): State<AppState>) -> Response {
    let ticket = match state.pipeline.admit(Transport::Http) {
        Admission::Accepted(ticket) => ticket,
        Admission::Busy => {
            return (StatusCode::CONFLICT, "Another client is already streaming\n").into_response();
        }
    };

    let pipeline = state.pipeline.clone();
    let opened = tokio::task::spawn_blocking(move || {
        let frame_ms = ticket.snapshot.frame_ms;
        let session = pipeline.open_capture(&ticket, frame_ms, HTTP_RING_MS);
        (ticket, session)
    })
    .await;

    let (ticket, session) = match opened {
        Ok((ticket, Ok(session))) => (ticket, session),
        Ok((_, Err(e))) => {
            tracing::warn!("Capture unavailable for HTTP client: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, format!("Capture unavailable: {}\n", e))
                .into_response();
        }
        Err(e) => {
            tracing::error!("Capture setup task failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_DEPTH);
    let shutdown = state.pipeline.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = stream_ogg(session, ticket, tx, shutdown).await {
            tracing::warn!("Ogg stream failed: {}", e);
        }
    });

    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    });

    (
        [
            (header::CONTENT_TYPE, OGG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// Get system status
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<SenderStatus>> {
    let config = state.pipeline.config().snapshot();
    Json(ApiResponse::ok(SenderStatus {
        pipeline: state.pipeline.status(),
        name: config.host_name.clone(),
        http_port: config.port,
        pcm_port: config.pcm_port,
    }))
}

/// Get the live config
pub async fn get_config(State(state): State<AppState>) -> Json<ApiResponse<ServerConfig>> {
    Json(ApiResponse::ok((*state.pipeline.config().snapshot()).clone()))
}

/// Apply a partial config update; running streams keep their snapshot
pub async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> (StatusCode, Json<ApiResponse<ServerConfig>>) {
    match state.pipeline.config().update(&update) {
        Ok(next) => (StatusCode::OK, Json(ApiResponse::ok((*next).clone()))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string()))),
    }
}
