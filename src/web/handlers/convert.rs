use axum::{
    extract::{multipart::Field, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::ApiResponse;
use crate::schedule::{ConversionKind, Engine, MediaType, TaskSpec};
use crate::utils::files::upload_path;
use crate::{AppContext, UPLOAD_DIR};

#[derive(Debug, Serialize)]
pub struct ConversionAccepted {
    pub conversion_id: String,
    pub message: String,
}

type FormError = (StatusCode, String);

fn invalid(message: impl Into<String>) -> FormError {
    (StatusCode::BAD_REQUEST, message.into())
}

/// Writes a multipart field to `path` chunk by chunk. Returns the byte count.
async fn stream_to_file(field: &mut Field<'_>, path: &Path) -> Result<u64, FormError> {
    let storage_error = |e: std::io::Error| {
        error!("Failed to save upload {}: {}", path.display(), e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload".to_string())
    };

    let mut file = tokio::fs::File::create(path).await.map_err(storage_error)?;
    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| invalid(format!("Failed to read uploaded file: {}", e)))?
    {
        file.write_all(&chunk).await.map_err(storage_error)?;
        size += chunk.len() as u64;
    }
    file.flush().await.map_err(storage_error)?;
    Ok(size)
}

/// The `/api/convert` form. The file part is spooled straight to disk.
#[derive(Debug, Default)]
struct ConvertForm {
    filename: Option<String>,
    stored: Option<PathBuf>,
    size: u64,
    conversion_type: Option<String>,
    conversion_engine: Option<String>,
    language: Option<String>,
}

impl ConvertForm {
    async fn read(&mut self, mut multipart: Multipart, upload_dir: &Path) -> Result<(), FormError> {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| invalid(format!("Invalid multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    if self.filename.is_some() {
                        warn!("Ignoring extra file part");
                        continue;
                    }
                    let filename = field.file_name().unwrap_or_default().to_string();
                    self.filename = Some(filename.clone());
                    // rejected later, no need to keep the body
                    if filename.is_empty() || MediaType::from_path(Path::new(&filename)) == MediaType::Unknown {
                        continue;
                    }

                    tokio::fs::create_dir_all(upload_dir).await.map_err(|e| {
                        error!("Failed to create upload directory: {}", e);
                        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload".to_string())
                    })?;
                    let path = upload_path(upload_dir, &filename);
                    self.stored = Some(path.clone());
                    self.size = stream_to_file(&mut field, &path).await?;
                }
                "conversion_type" | "conversion_engine" | "language" => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| invalid(format!("Failed to read field {}: {}", name, e)))?;
                    let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                    match name.as_str() {
                        "conversion_type" => self.conversion_type = value,
                        "conversion_engine" => self.conversion_engine = value,
                        _ => self.language = value,
                    }
                }
                other => warn!("Ignoring unknown form field {}", other),
            }
        }
        Ok(())
    }

    fn to_spec(&self, default_language: &str) -> Result<TaskSpec, FormError> {
        let Some(filename) = self.filename.clone() else {
            return Err(invalid("No file uploaded"));
        };
        if filename.is_empty() {
            return Err(invalid("No file selected"));
        }
        let Some(input_path) = self.stored.clone() else {
            return Err(invalid(format!("Unsupported file type: {}", filename)));
        };

        let kind: ConversionKind = self
            .conversion_type
            .as_deref()
            .unwrap_or("mp4_to_mp3")
            .parse()
            .map_err(invalid)?;
        let engine = self
            .conversion_engine
            .as_deref()
            .map(str::parse::<Engine>)
            .transpose()
            .map_err(invalid)?;
        let language = self
            .language
            .clone()
            .or_else(|| Some(default_language.to_string()));

        Ok(TaskSpec {
            input_path,
            filename,
            kind,
            engine,
            language,
        })
    }

    /// Removes the spooled upload, complete or not.
    async fn discard(&mut self) {
        if let Some(path) = self.stored.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove rejected upload {}: {}", path.display(), e);
            }
        }
    }
}

fn reject((status, message): FormError) -> Response {
    (status, Json(ApiResponse::error(message))).into_response()
}

/// `POST /api/convert`: stores the upload and queues a conversion.
pub async fn convert(State(ctx): State<Arc<AppContext>>, multipart: Multipart) -> Response {
    let mut form = ConvertForm::default();
    if let Err(e) = form.read(multipart, &UPLOAD_DIR).await {
        form.discard().await;
        return reject(e);
    }

    let spec = match form.to_spec(&ctx.config.default_language) {
        Ok(spec) => spec,
        Err(e) => {
            form.discard().await;
            return reject(e);
        }
    };
    info!(
        "Stored upload {} ({} bytes) at {}",
        spec.filename,
        form.size,
        spec.input_path.display()
    );

    match ctx.dispatcher.submit(spec) {
        Ok(conversion_id) => (
            StatusCode::OK,
            Json(ApiResponse::success(ConversionAccepted {
                conversion_id,
                message: "Conversion started".to_string(),
            })),
        )
            .into_response(),
        Err(e) => {
            warn!("Rejected conversion request: {}", e);
            form.discard().await;
            reject(invalid(e.to_string()))
        }
    }
}
