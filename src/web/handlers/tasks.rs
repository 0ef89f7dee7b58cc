use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::error;

use super::ApiResponse;
use crate::schedule::{Engine, HistoryEntry, TaskSnapshot, TaskStatus};
use crate::AppContext;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error(message))).into_response()
}

// Get conversion endpoint
pub async fn get_conversion(
    State(ctx): State<Arc<AppContext>>,
    Path(conversion_id): Path<String>,
) -> Response {
    match ctx.dispatcher.get_status(&conversion_id) {
        Some(task) => (StatusCode::OK, Json(ApiResponse::success(task))).into_response(),
        None => not_found("Conversion not found"),
    }
}

#[derive(Debug, Serialize)]
pub struct ActiveConversions {
    pub active_conversions: Vec<TaskSnapshot>,
    pub history_count: usize,
}

// List active conversions endpoint
pub async fn list_conversions(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let active = ctx.dispatcher.list_active();
    Json(ApiResponse::success(ActiveConversions {
        active_conversions: active.active,
        history_count: active.history_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
    pub total: usize,
}

// Conversion history endpoint
pub async fn history(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let page = ctx.dispatcher.history(limit);
    Json(ApiResponse::success(HistoryResponse {
        history: page.entries,
        total: page.total,
    }))
}

pub(crate) fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "txt" => "text/plain; charset=utf-8",
        "srt" => "application/x-subrip",
        _ => "application/octet-stream",
    }
}

// Download result endpoint
pub async fn download(
    State(ctx): State<Arc<AppContext>>,
    Path(conversion_id): Path<String>,
) -> Response {
    let Some(task) = ctx.dispatcher.get_status(&conversion_id) else {
        return not_found("Conversion not found");
    };
    if task.status != TaskStatus::Completed {
        return not_found("Conversion has no output yet");
    }
    let (Some(path), Some(file_name)) = (task.output_path.clone(), task.output_file_name()) else {
        return not_found("Output file not found");
    };

    match tokio::fs::File::open(&path).await {
        Ok(file) => (
            [
                (header::CONTENT_TYPE, content_type_for(&file_name).to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name),
                ),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found("Output file not found"),
        Err(e) => {
            error!("Failed to open output {}: {}", path.display(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("Failed to read output file")),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub engines: Vec<Engine>,
    pub max_concurrent_jobs: usize,
    pub running_jobs: usize,
    pub active_conversions: usize,
}

// Service status endpoint
pub async fn service_status(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let dispatcher = &ctx.dispatcher;
    Json(ApiResponse::success(ServiceStatus {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        engines: dispatcher.engines(),
        max_concurrent_jobs: dispatcher.max_concurrent_jobs(),
        running_jobs: dispatcher.running_jobs(),
        active_conversions: dispatcher.list_active().active.len(),
    }))
}
