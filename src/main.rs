#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use convert_rs::{
    asr::remote::RemoteAsr,
    config::AppConfig,
    schedule::{
        stage::{extract::ExtractAudioStage, transcribe::TranscribeStage},
        Dispatcher, DispatcherOptions, Engine, StageCatalog,
    },
    utils::logger,
    AppContext, OUTPUT_DIR, TMP_DIR,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const CONVERSION_LOG: &str = "conversions.jsonl";

#[cfg(feature = "whisper")]
fn register_whisper(catalog: StageCatalog, config: &AppConfig) -> StageCatalog {
    use convert_rs::asr::whisper::WhisperAsr;

    if !config.whisper_model.exists() {
        warn!(
            "Whisper model not found at {}, whisper engine disabled",
            config.whisper_model.display()
        );
        return catalog;
    }

    info!("Initializing Whisper ASR model...");
    match WhisperAsr::new(
        &config.whisper_model,
        config.extract.ffmpeg_path.clone(),
        TMP_DIR.clone(),
        config.default_language.clone(),
    ) {
        Ok(asr) => catalog.with_transcriber(
            Engine::Whisper,
            Arc::new(TranscribeStage::new(Engine::Whisper, Arc::new(asr))),
        ),
        Err(e) => {
            warn!("Failed to load whisper model, engine disabled: {}", e);
            catalog
        }
    }
}

#[cfg(not(feature = "whisper"))]
fn register_whisper(catalog: StageCatalog, _config: &AppConfig) -> StageCatalog {
    info!("Built without the whisper feature, whisper engine disabled");
    catalog
}

fn build_catalog(config: &AppConfig) -> StageCatalog {
    let extractor = Arc::new(ExtractAudioStage::new(config.extract.clone()));
    let mut catalog = register_whisper(StageCatalog::new(extractor), config);

    if let Some(remote) = &config.remote_asr {
        info!("Using remote ASR service at {}", remote.url);
        let asr = RemoteAsr::new(remote.url.clone(), remote.api_key.clone(), remote.model.clone());
        catalog = catalog.with_transcriber(
            Engine::Remote,
            Arc::new(TranscribeStage::new(Engine::Remote, Arc::new(asr))),
        );
    }

    if catalog.engines().is_empty() {
        warn!("No transcription engine available, only mp4_to_mp3 conversions will be accepted");
    }
    catalog
}

#[tokio::main]
async fn main() -> Result<()> {
    convert_rs::init_env();
    let config = AppConfig::from_env()?;

    // keep the guard alive so the file log is flushed
    let _guard = logger::init(&config.log_dir)?;

    info!("Starting conversion service...");

    let catalog = build_catalog(&config);
    let dispatcher = Arc::new(
        Dispatcher::new(
            catalog,
            DispatcherOptions {
                max_concurrent_jobs: config.max_concurrent_jobs,
                retention: config.retention,
                history_capacity: config.history_capacity,
                output_dir: OUTPUT_DIR.clone(),
                scratch_dir: TMP_DIR.clone(),
            },
        )
        .with_conversion_log(config.log_dir.join(CONVERSION_LOG)),
    );
    info!(
        "Dispatcher ready: {} concurrent jobs, engines {:?}",
        dispatcher.max_concurrent_jobs(),
        dispatcher.engines()
    );
    let _maintenance = dispatcher.spawn_maintenance(MAINTENANCE_INTERVAL);

    let addr = config.bind_addr()?;
    let ctx = Arc::new(AppContext {
        dispatcher,
        config: Arc::new(config),
    });

    info!("Starting HTTP server at http://{}", addr);
    match convert_rs::web::start_server(ctx, addr).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
    }

    info!("Shutting down...");
    Ok(())
}
