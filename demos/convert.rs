//! Runs one conversion in the foreground with a terminal progress bar.
//!
//! ```text
//! cargo run --example convert -- --kind mp4_to_txt --engine remote talk.mp4
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use convert_rs::asr::remote::RemoteAsr;
use convert_rs::config::AppConfig;
use convert_rs::schedule::stage::extract::ExtractAudioStage;
use convert_rs::schedule::stage::transcribe::TranscribeStage;
use convert_rs::schedule::stage::StageConfig;
use convert_rs::schedule::{ConversionKind, Engine, StageCatalog};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input video or audio file
    input: PathBuf,

    /// mp4_to_mp3, mp3_to_txt or mp4_to_txt
    #[arg(short, long, default_value = "mp4_to_mp3")]
    kind: ConversionKind,

    /// Transcription engine for the *_to_txt kinds
    #[arg(short, long)]
    engine: Option<Engine>,

    /// Output file, defaults to the input with the kind's extension
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Recognition language
    #[arg(short, long)]
    language: Option<String>,

    /// Print every progress report on its own line
    #[arg(short, long)]
    verbose: bool,
}

fn catalog(config: &AppConfig) -> StageCatalog {
    let mut catalog = StageCatalog::new(Arc::new(ExtractAudioStage::new(config.extract.clone())));
    if let Some(remote) = &config.remote_asr {
        let asr = RemoteAsr::new(remote.url.clone(), remote.api_key.clone(), remote.model.clone());
        catalog = catalog.with_transcriber(
            Engine::Remote,
            Arc::new(TranscribeStage::new(Engine::Remote, Arc::new(asr))),
        );
    }
    catalog
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    if args.verbose {
        tracing_subscriber::fmt::init();
    }

    let config = AppConfig::from_env()?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension(args.kind.output_extension()));
    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;

    let pipeline = catalog(&config)
        .compose(args.kind, args.engine, scratch.path())
        .with_context(|| format!("Cannot run {}", args.kind))?;
    println!("{} -> {} via {:?}", args.input.display(), output.display(), pipeline.stage_names());

    let mut stage_config = StageConfig::new();
    let language = args.language.unwrap_or(config.default_language);
    stage_config.insert("language".to_string(), language.into());

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template("|{bar:30}| {pos:>3}% {msg}")?.progress_chars("█░-"));
    let verbose = args.verbose;
    let report = |percent: u8, message: &str| {
        if verbose {
            bar.println(format!("[{:3}%] {}", percent, message));
        }
        bar.set_position(percent as u64);
        bar.set_message(message.to_string());
    };

    let outcome = pipeline
        .run("cli", &args.input, &output, &stage_config, &report)
        .await;

    if outcome.ok {
        bar.finish_with_message(outcome.message);
        println!("Saved {}", output.display());
        Ok(())
    } else {
        bar.abandon_with_message(outcome.message.clone());
        anyhow::bail!("Conversion failed: {}", outcome.message)
    }
}
