use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::info;

use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};

/// Speech recognition through an OpenAI-compatible
/// `/v1/audio/transcriptions` endpoint.
pub struct RemoteAsr {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}

impl RemoteAsr {
    pub fn new(url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
            model,
        }
    }

    fn into_result(body: VerboseTranscription) -> TranscribeResult {
        let segments = body
            .segments
            .into_iter()
            .map(|s| TranscribeSegment {
                text: s.text,
                start: s.start,
                end: s.end,
            })
            .collect();

        TranscribeResult {
            segments,
            full_text: body.text,
        }
    }
}

#[async_trait]
impl AsrEngine for RemoteAsr {
    async fn transcribe(&self, audio_path: &Path, params: AsrParams) -> Result<TranscribeResult> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read audio file {}: {}", audio_path.display(), e))?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        info!("Uploading {} ({} bytes) to {}", file_name, bytes.len(), self.url);

        let mut form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name))
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(language) = params.language {
            form = form.text("language", language);
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Recognition service request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Recognition service returned {}: {}",
                status,
                body.trim()
            ));
        }

        let body: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid recognition service response: {}", e))?;

        Ok(Self::into_result(body))
    }
}
