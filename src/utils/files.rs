use std::path::{Path, PathBuf};

use chrono::Local;

/// Reduces an uploaded file name to a safe basename: path components are
/// dropped and anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Where an upload is stored: `<dir>/<YYYYmmdd_HHMMSS>_<sanitized name>`.
pub fn upload_path(dir: &Path, original: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}", stamp, sanitize_filename(original)))
}
