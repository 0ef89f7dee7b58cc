use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ReportFn, Stage, StageConfig, StageOutcome};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("ffmpeg not found at path: {path}")]
    FfmpegNotFound { path: PathBuf },

    #[error("input file not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExtractAudioConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// e.g. "64k"
    pub audio_bitrate: String,
    pub audio_channels: u8,
    pub sample_rate: u32,
}

impl Default for ExtractAudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            audio_bitrate: "64k".to_string(),
            audio_channels: 1,
            sample_rate: 16000,
        }
    }
}

/// Extracts the audio track of a video into an mp3 with ffmpeg.
pub struct ExtractAudioStage {
    config: ExtractAudioConfig,
}

// share of the local range spent before ffmpeg starts
const PROBE_SHARE: u8 = 5;

impl ExtractAudioStage {
    pub fn new(config: ExtractAudioConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-c:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            self.config.audio_bitrate.clone(),
            "-ac".to_string(),
            self.config.audio_channels.to_string(),
            "-ar".to_string(),
            self.config.sample_rate.to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Duration of the input in seconds, if ffprobe can tell.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_probe_duration(json: &str) -> Option<f64> {
    #[derive(Deserialize)]
    struct ProbeOutput {
        format: ProbeFormat,
    }

    #[derive(Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }

    let probe: ProbeOutput = serde_json::from_str(json).ok()?;
    probe
        .format
        .duration
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
}

/// Local percent for `elapsed` seconds of output, scaled past the probe share.
fn progress_percent(elapsed_secs: f64, duration_secs: f64) -> u8 {
    if duration_secs <= 0.0 {
        return PROBE_SHARE;
    }
    let ratio = (elapsed_secs / duration_secs).clamp(0.0, 1.0);
    let span = (99 - PROBE_SHARE) as f64;
    PROBE_SHARE + (ratio * span) as u8
}

#[async_trait]
impl Stage for ExtractAudioStage {
    fn name(&self) -> &'static str {
        "extract_audio"
    }

    fn output_extension(&self) -> &'static str {
        "mp3"
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        _config: &StageConfig,
        report: ReportFn<'_>,
    ) -> Result<StageOutcome> {
        if !input.exists() {
            return Err(ExtractError::InputNotFound {
                path: input.to_path_buf(),
            }
            .into());
        }

        report(0, "Reading video information");
        let duration_secs = self.probe_duration(input).await;
        debug!("Probed duration of {}: {:?}", input.display(), duration_secs);

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        report(PROBE_SHARE, "Extracting audio with ffmpeg");
        info!("Extracting audio from {} to {}", input.display(), output.display());

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(self.build_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExtractError::FfmpegNotFound {
                        path: self.config.ffmpeg_path.clone(),
                    }
                } else {
                    ExtractError::Io(e)
                }
            })?;

        let time_regex = Regex::new(r"out_time_ms=(\d+)")?;
        let mut error_output = String::new();
        let mut last_percent = PROBE_SHARE;

        if let Some(stderr) = child.stderr.take() {
            // ffmpeg echoes tags verbatim, which need not be UTF-8
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to read ffmpeg output: {}", e);
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();

                if let Some(caps) = time_regex.captures(line) {
                    // ffmpeg reports out_time_ms in microseconds
                    let elapsed = caps
                        .get(1)
                        .and_then(|m| m.as_str().parse::<f64>().ok())
                        .map(|us| us / 1_000_000.0);
                    if let (Some(elapsed), Some(duration)) = (elapsed, duration_secs) {
                        let percent = progress_percent(elapsed, duration);
                        if percent > last_percent {
                            last_percent = percent;
                            report(percent, &format!("Extracting audio ({:.0}s / {:.0}s)", elapsed, duration));
                        }
                    }
                } else if !line.contains('=') && !line.trim().is_empty() {
                    error_output.push_str(line);
                    error_output.push('\n');
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!("ffmpeg failed for {}: {}", input.display(), error_output.trim());
            return Ok(StageOutcome::failure(format!(
                "Audio extraction failed: ffmpeg exited with code {:?}",
                status.code()
            ))
            .with_metadata("cause", "transcoder")
            .with_metadata("stderr", error_output.trim()));
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Ok(StageOutcome::failure("Audio extraction produced no output")
                .with_metadata("cause", "transcoder"));
        }

        report(100, "Audio extraction complete");
        let mut outcome = StageOutcome::success("Audio extracted successfully")
            .with_metadata("output_size_bytes", size)
            .with_metadata("bitrate", self.config.audio_bitrate.as_str())
            .with_metadata("sample_rate", self.config.sample_rate);
        if let Some(duration) = duration_secs {
            outcome = outcome.with_metadata("duration_secs", duration);
        }
        Ok(outcome)
    }
}
