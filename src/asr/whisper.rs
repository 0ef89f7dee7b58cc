use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};
use crate::audio;

pub struct WhisperAsr {
    whisper_ctx: Arc<WhisperContext>,
    ffmpeg: PathBuf,
    scratch_dir: PathBuf,
    default_language: String,
}

impl WhisperAsr {
    pub fn new(model_path: &Path, ffmpeg: PathBuf, scratch_dir: PathBuf, default_language: String) -> Result<Self> {
        let model = model_path.to_string_lossy();
        match WhisperContext::new_with_params(&model, WhisperContextParameters::default()) {
            Ok(whisper_ctx) => Ok(Self {
                whisper_ctx: Arc::new(whisper_ctx),
                ffmpeg,
                scratch_dir,
                default_language,
            }),
            Err(e) => Err(anyhow::anyhow!("failed to open whisper model: {}", e)),
        }
    }

    fn build_params(language: &str) -> FullParams<'_, '_> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        params.set_language(Some(language));
        params.set_temperature(0.3);
        params.set_n_threads(8);
        params.set_translate(false);
        params.set_no_context(false);
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);

        // keep whisper.cpp quiet, progress goes through the task instead
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);

        params
    }

    fn run_model(ctx: &WhisperContext, audio: &[f32], language: &str) -> Result<TranscribeResult> {
        let mut state = ctx.create_state()?;
        let params = Self::build_params(language);
        state.full(params, audio)?;

        let num_segments = state.full_n_segments()?;
        let mut segments = Vec::new();
        let mut full_text = String::new();

        for i in 0..num_segments {
            let text = state.full_get_segment_text(i)?;
            // timestamps are in 10 ms units
            let start = state.full_get_segment_t0(i)? as f64 / 100.0;
            let end = state.full_get_segment_t1(i)? as f64 / 100.0;

            full_text.push_str(&text);
            segments.push(TranscribeSegment { text, start, end });
        }

        Ok(TranscribeResult {
            segments,
            full_text: full_text.trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AsrEngine for WhisperAsr {
    async fn transcribe(&self, audio_path: &Path, params: AsrParams) -> Result<TranscribeResult> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let wav = tempfile::Builder::new()
            .prefix("whisper-")
            .suffix(".wav")
            .tempfile_in(&self.scratch_dir)?;

        audio::decode_to_wav(&self.ffmpeg, audio_path, wav.path()).await?;
        let (samples, _) = audio::read_wav_samples(wav.path())?;

        let ctx = self.whisper_ctx.clone();
        let language = params
            .language
            .clone()
            .unwrap_or_else(|| self.default_language.clone());

        tokio::task::spawn_blocking(move || Self::run_model(&ctx, &samples, &language))
            .await
            .map_err(|e| anyhow::anyhow!("whisper worker failed: {}", e))?
    }
}
