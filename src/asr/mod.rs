use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod remote;
#[cfg(feature = "whisper")]
pub mod whisper;

#[derive(Debug, Clone, Default)]
pub struct AsrParams {
    pub language: Option<String>,
}

impl AsrParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub text: String,
    /// seconds
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub segments: Vec<TranscribeSegment>,
    pub full_text: String,
}

impl TranscribeResult {
    /// Renders the segments as SubRip subtitles.
    pub fn to_srt(&self) -> String {
        let mut srt = String::new();
        let cues = self
            .segments
            .iter()
            .map(|s| (s, s.text.trim()))
            .filter(|(_, text)| !text.is_empty());
        for (i, (segment, text)) in cues.enumerate() {
            srt.push_str(&format!(
                "{}\n{} --> {}\n{}\n\n",
                i + 1,
                format_srt_time(segment.start),
                format_srt_time(segment.end),
                text
            ));
        }
        srt
    }
}

/// `HH:MM:SS,mmm`
pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, params: AsrParams) -> Result<TranscribeResult>;
}
