use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::AppContext;

pub mod convert;
pub mod tasks;
pub mod ws;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let upload_limit = ctx.config.max_upload_bytes;
    Router::new()
        .route(
            "/api/convert",
            post(convert::convert).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/conversion/:conversion_id", get(tasks::get_conversion))
        .route("/api/conversions", get(tasks::list_conversions))
        .route("/api/history", get(tasks::history))
        .route("/api/download/:conversion_id", get(tasks::download))
        .route("/api/status", get(tasks::service_status))
        .route("/ws", get(ws::ws_handler))
        .with_state(ctx)
}

/// JSON envelope shared by the HTTP handlers. The payload's fields are
/// inlined next to `success`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(flatten)]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}
