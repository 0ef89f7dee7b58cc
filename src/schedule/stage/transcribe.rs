use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{ReportFn, Stage, StageConfig, StageOutcome};
use crate::asr::{AsrEngine, AsrParams};
use crate::schedule::types::Engine;

/// Turns an audio file into a `.txt` transcript plus a sibling `.srt`.
pub struct TranscribeStage {
    engine: Engine,
    asr: Arc<dyn AsrEngine>,
}

impl TranscribeStage {
    pub fn new(engine: Engine, asr: Arc<dyn AsrEngine>) -> Self {
        Self { engine, asr }
    }

    fn params(config: &StageConfig) -> AsrParams {
        let mut params = AsrParams::new();
        params.set_language(
            config
                .get("language")
                .and_then(|v| v.as_str())
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
        params
    }
}

#[async_trait]
impl Stage for TranscribeStage {
    fn name(&self) -> &'static str {
        "transcribe"
    }

    fn output_extension(&self) -> &'static str {
        "txt"
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &StageConfig,
        report: ReportFn<'_>,
    ) -> Result<StageOutcome> {
        if !input.exists() {
            return Ok(StageOutcome::failure(format!("Audio file not found: {}", input.display()))
                .with_metadata("cause", "input validation"));
        }

        report(5, "Preparing audio file");
        let params = Self::params(config);

        report(20, &format!("Running speech recognition ({})", self.engine));
        info!("Transcribing {} with {} engine", input.display(), self.engine);

        let result = match self.asr.transcribe(input, params).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} engine failed on {}: {:#}", self.engine, input.display(), e);
                return Ok(StageOutcome::failure(format!("Speech recognition failed: {:#}", e))
                    .with_metadata("cause", "recognition engine error")
                    .with_metadata("engine", self.engine.as_str()));
            }
        };

        report(90, "Writing transcript and subtitles");
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let srt_path = output.with_extension("srt");
        let srt = result.to_srt();
        tokio::fs::write(output, &result.full_text).await?;
        tokio::fs::write(&srt_path, &srt).await?;

        report(100, "Transcription complete");
        Ok(StageOutcome::success("Transcription completed successfully")
            .with_metadata("engine", self.engine.as_str())
            .with_metadata("segments", result.segments.len())
            .with_metadata("text_length", result.full_text.chars().count())
            .with_metadata("srt_file", srt_path.to_string_lossy().into_owned()))
    }
}
