use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;

use crate::schedule::stage::extract::ExtractAudioConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAsrConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Service settings read from `CONVERT_*` variables, falling back to `.env`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_jobs: usize,
    pub retention: Duration,
    pub history_capacity: usize,
    pub max_upload_bytes: usize,
    pub default_language: String,
    pub log_dir: PathBuf,
    pub extract: ExtractAudioConfig,
    pub whisper_model: PathBuf,
    pub remote_asr: Option<RemoteAsrConfig>,
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).or_else(|_| dotenv::var(key)).ok()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_or = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let defaults = ExtractAudioConfig::default();
        let extract = ExtractAudioConfig {
            ffmpeg_path: PathBuf::from(env_or("CONVERT_FFMPEG", "ffmpeg")),
            ffprobe_path: PathBuf::from(env_or("CONVERT_FFPROBE", "ffprobe")),
            audio_bitrate: env_or("CONVERT_AUDIO_BITRATE", &defaults.audio_bitrate),
            audio_channels: env_parse(&lookup, "CONVERT_AUDIO_CHANNELS", defaults.audio_channels)?,
            sample_rate: env_parse(&lookup, "CONVERT_SAMPLE_RATE", defaults.sample_rate)?,
        };

        let remote_asr = lookup("CONVERT_REMOTE_ASR_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| RemoteAsrConfig {
                url,
                api_key: lookup("CONVERT_REMOTE_ASR_KEY").filter(|k| !k.is_empty()),
                model: env_or("CONVERT_REMOTE_ASR_MODEL", "whisper-1"),
            });

        Ok(Self {
            host: env_or("CONVERT_HOST", "127.0.0.1"),
            port: env_parse(&lookup, "CONVERT_PORT", 7000)?,
            max_concurrent_jobs: env_parse(&lookup, "CONVERT_MAX_JOBS", 2usize)?.max(1),
            retention: Duration::from_secs(env_parse(&lookup, "CONVERT_RETENTION_SECS", 3600)?),
            history_capacity: env_parse(&lookup, "CONVERT_HISTORY_CAPACITY", 1000)?,
            max_upload_bytes: env_parse(&lookup, "CONVERT_MAX_UPLOAD_MB", 1024usize)? * 1024 * 1024,
            default_language: env_or("CONVERT_LANGUAGE", "zh"),
            log_dir: PathBuf::from(env_or("CONVERT_LOG_DIR", "./logs")),
            extract,
            whisper_model: PathBuf::from(env_or("CONVERT_WHISPER_MODEL", "./models/ggml-large-v3.bin")),
            remote_asr,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.host, self.port, e))
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}
