//! Local control surface (spec.md §4.9): a small localhost-only HTTP
//! API for status polling, live progress, and manually kicking a
//! folder's sync pass. No external UI owns the core; it only observes
//! through `ActivityListener`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::unfold;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::sync_loop::{ActivityListener, SyncLoop};
use crate::telemetry::SyncStats;

#[derive(Clone, Serialize)]
pub struct SyncEvent {
    folder: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(rename = "ts")]
    timestamp: DateTime<Utc>,
}

struct ControlState {
    loops: HashMap<String, Arc<SyncLoop>>,
    stats: Arc<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
}

/// Feeds `/v1/events` and the shared `SyncStats` from sync loop
/// callbacks; the one concrete `ActivityListener` a running daemon
/// installs.
pub struct ControlActivityListener {
    stats: Arc<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
}

impl ActivityListener for ControlActivityListener {
    fn started(&self, folder: &str) {
        let _ = self.events.send(SyncEvent {
            folder: folder.to_string(),
            kind: "started".to_string(),
            ok: None,
            timestamp: Utc::now(),
        });
    }

    fn stopped(&self, folder: &str, result: &Result<(), String>) {
        match result {
            Ok(()) => self.stats.record_success(folder),
            Err(err) => self.stats.record_failure(folder, err),
        }
        let _ = self.events.send(SyncEvent {
            folder: folder.to_string(),
            kind: "stopped".to_string(),
            ok: Some(result.is_ok()),
            timestamp: Utc::now(),
        });
    }
}

pub struct ControlSurface {
    bound_addr: SocketAddr,
}

impl ControlSurface {
    /// Builds the `ActivityListener` the sync loops should be
    /// constructed with, and starts the HTTP server.
    pub fn new_listener(stats: Arc<SyncStats>) -> (Arc<ControlActivityListener>, broadcast::Sender<SyncEvent>) {
        let (tx, _) = broadcast::channel(1024);
        (
            Arc::new(ControlActivityListener {
                stats,
                events: tx.clone(),
            }),
            tx,
        )
    }

    pub async fn start(
        addr: &str,
        loops: HashMap<String, Arc<SyncLoop>>,
        stats: Arc<SyncStats>,
        events: broadcast::Sender<SyncEvent>,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        let state = Arc::new(ControlState {
            loops,
            stats,
            events,
        });

        let app = Router::new()
            .route("/v1/status", get(status))
            .route("/v1/events", get(events_stream))
            .route("/v1/sync/:folder", post(trigger_sync))
            .with_state(state);

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await;
            if let Err(e) = result {
                crate::logging::error(format!("control surface server error: {e}"));
            }
            crate::logging::info("control surface stopped");
        });

        crate::logging::info_kv("control surface started", &[("addr", &bound_addr.to_string())]);
        Ok(Self { bound_addr })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }
}

#[derive(Serialize, serde::Deserialize)]
struct FolderStatus {
    name: String,
    syncing: bool,
}

#[derive(Serialize, serde::Deserialize)]
struct StatusResponse {
    version: String,
    folders: Vec<FolderStatus>,
    stats: crate::telemetry::SyncStatsSnapshot,
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let mut folders: Vec<FolderStatus> = state
        .loops
        .values()
        .map(|l| FolderStatus {
            name: l.folder_name().to_string(),
            syncing: l.is_syncing(),
        })
        .collect();
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        folders,
        stats: state.stats.snapshot(),
    })
}

async fn events_stream(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let stream = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
                    let event = Event::default().event("sync").data(data);
                    return Some((Ok::<_, std::convert::Infallible>(event), rx));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

async fn trigger_sync(
    State(state): State<Arc<ControlState>>,
    AxumPath(folder): AxumPath<String>,
) -> impl IntoResponse {
    match state.loops.get(&folder) {
        Some(l) => {
            l.trigger();
            (StatusCode::OK, Json(serde_json::json!({ "status": "triggered" }))).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
