//! Web server module: axum HTTP surface for playback and status.
//!
//! Media routes live under `/:cam/:stream/:file` and dispatch on the file
//! name, the same names the manifest hands out:
//!
//! - `init-<recId>.mp4` — a recording's initialization block
//! - `<key>_<n>.m4s` — a segment reconstructed from indexed byte ranges
//! - `<name>.m3u8` — playlist for a time window (default: last 30 minutes)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::capacity::SpaceProbe;
use crate::index::ArchiveIndex;
use crate::lifecycle::LifecycleController;
use crate::playback::{self, ReconstructionKey};

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const DEFAULT_WINDOW_MS: i64 = 30 * 60 * 1000;

pub struct WebState {
    pub index: Arc<ArchiveIndex>,
    pub lifecycle: Arc<LifecycleController>,
    pub probe: Arc<dyn SpaceProbe>,
    pub target_duration_ms: i64,
    pub start_time: Instant,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/api/recordings/:cam", get(api_recordings))
        .route("/api/status", get(api_status))
        .route("/:cam/:stream/:file", get(stream_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start(state: Arc<WebState>, bind: SocketAddr) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding web server to {bind}"))?;
    info!("web server listening on http://{bind}");
    axum::serve(listener, app).await.context("web server error")
}

#[derive(Deserialize)]
struct WindowQuery {
    from: Option<i64>,
    to: Option<i64>,
}

impl WindowQuery {
    /// Resolve to a concrete `[from, to)` window, defaulting to the last
    /// 30 minutes.
    fn resolve(&self) -> (i64, i64) {
        let now = chrono::Utc::now().timestamp_millis();
        let to = self.to.unwrap_or(now);
        let from = self.from.unwrap_or(to - DEFAULT_WINDOW_MS);
        (from, to)
    }
}

/// GET /:cam/:stream/:file — manifest, init block or reconstructed segment.
async fn stream_file(
    Path((cam, _stream, file)): Path<(String, String, String)>,
    Query(window): Query<WindowQuery>,
    State(state): State<Arc<WebState>>,
) -> Response {
    if file.ends_with(".m3u8") {
        return manifest_response(&state, &cam, &window);
    }
    if let Some(rest) = file.strip_prefix("init-") {
        let Some(id) = rest.strip_suffix(".mp4").and_then(|s| s.parse::<i64>().ok()) else {
            return (StatusCode::BAD_REQUEST, "bad init segment name").into_response();
        };
        return match playback::init_segment(&state.index, id).await {
            Ok(bytes) => media_response(bytes),
            Err(err) => {
                warn!(camera = %cam, recording = id, %err, "init block unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "init block unavailable").into_response()
            }
        };
    }
    if file.ends_with(".m4s") {
        let (key, _seq) = match ReconstructionKey::parse_filename(&file) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(camera = %cam, file = %file, %err, "malformed segment name");
                return (StatusCode::BAD_REQUEST, "malformed segment name").into_response();
            }
        };
        return match playback::reconstruct(&state.index, &key).await {
            Ok(bytes) => media_response(bytes),
            Err(err) => {
                warn!(camera = %cam, file = %file, %err, "segment unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "segment unavailable").into_response()
            }
        };
    }
    (StatusCode::NOT_FOUND, "no such stream file").into_response()
}

fn manifest_response(state: &WebState, cam: &str, window: &WindowQuery) -> Response {
    let (from, to) = window.resolve();
    match playback::manifest_for_range(&state.index, cam, from, to, state.target_duration_ms) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)],
            text,
        )
            .into_response(),
        Err(err) => {
            warn!(camera = %cam, %err, "manifest build failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "manifest build failed").into_response()
        }
    }
}

fn media_response(bytes: bytes::Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "video/mp4")],
        bytes,
    )
        .into_response()
}

/// GET /api/recordings/:cam — recordings overlapping a time window.
async fn api_recordings(
    Path(cam): Path<String>,
    Query(window): Query<WindowQuery>,
    State(state): State<Arc<WebState>>,
) -> Response {
    let (from, to) = window.resolve();
    match state.index.recordings_in_range(&cam, from, to) {
        Ok(recordings) => {
            let list: Vec<serde_json::Value> = recordings
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "camera": r.camera_id,
                        "filename": r.filename,
                        "start_date": r.start_date,
                        "end_date": r.end_date,
                        "duration_ms": r.duration_ms,
                        "file_size": r.file_size,
                        "completed": r.completed,
                    })
                })
                .collect();
            Json(serde_json::json!(list)).into_response()
        }
        Err(err) => {
            warn!(camera = %cam, %err, "recording list failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "recording list failed").into_response()
        }
    }
}

/// GET /api/status — volumes, usage and active streams.
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let mut volumes = Vec::new();
    if let Ok(list) = state.index.active_volumes() {
        for volume in list {
            let free = state
                .probe
                .free_bytes(&volume.mount_point)
                .await
                .unwrap_or(0);
            let used = state.index.usage_bytes(volume.id).unwrap_or(0);
            volumes.push(serde_json::json!({
                "id": volume.id,
                "mount_point": volume.mount_point,
                "free_bytes": free,
                "used_bytes": used,
                "min_free_bytes": volume.min_free_bytes,
                "max_use_bytes": volume.max_use_bytes,
            }));
        }
    }
    Json(serde_json::json!({
        "uptime_secs": uptime,
        "volumes": volumes,
        "streams": state.lifecycle.active_streams(),
    }))
}
