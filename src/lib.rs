pub mod asr;
pub mod audio;
pub mod config;
pub mod schedule;
pub mod utils;
pub mod web;

use std::{env, path::PathBuf, sync::Arc};

use config::AppConfig;
use once_cell::sync::Lazy;
use schedule::Dispatcher;

pub struct AppContext {
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<AppConfig>,
}

const CONVERT_UPLOAD_DIR: &str = "./convert_data/uploads/";
const CONVERT_OUTPUT_DIR: &str = "./convert_data/outputs/";
const CONVERT_TMP_DIR: &str = "./convert_data/tmp/";

fn env_path(key: &str, default: &str) -> PathBuf {
    match env::var(key) {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(dotenv::var(key).unwrap_or_else(|_| default.to_string())),
    }
}

/// Uploaded source files.
pub static UPLOAD_DIR: Lazy<PathBuf> = Lazy::new(|| env_path("CONVERT_UPLOAD_DIR", CONVERT_UPLOAD_DIR));

/// Finished conversion results.
pub static OUTPUT_DIR: Lazy<PathBuf> = Lazy::new(|| env_path("CONVERT_OUTPUT_DIR", CONVERT_OUTPUT_DIR));

/// Intermediate files of multi-stage pipelines.
pub static TMP_DIR: Lazy<PathBuf> = Lazy::new(|| env_path("CONVERT_TMP_DIR", CONVERT_TMP_DIR));

pub fn init_env() {
    dotenv::dotenv().ok();

    // make sure the data directories exist
    for dir in [&*UPLOAD_DIR, &*OUTPUT_DIR, &*TMP_DIR] {
        std::fs::create_dir_all(dir).unwrap_or_else(|e| {
            eprintln!("Failed to create directory {}: {}", dir.display(), e);
        });
    }
}
