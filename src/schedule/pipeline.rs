use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::schedule::stage::{ReportFn, Stage, StageConfig, StageOutcome, StageRunner};
use crate::schedule::types::{ConversionKind, Engine, Metadata};

struct PipelineStep {
    stage: Arc<dyn Stage>,
    weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub ok: bool,
    pub message: String,
    /// stage name -> that stage's metadata, plus `failed_stage` on failure
    pub metadata: Metadata,
}

impl PipelineOutcome {
    pub fn failed(stage: &str, message: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("failed_stage".to_string(), Value::from(stage));
        Self {
            ok: false,
            message: message.into(),
            metadata,
        }
    }
}

/// Files that must not outlive a pipeline run, removed on drop.
struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed intermediate file {}", path.display()),
                Err(e) => warn!("Failed to remove intermediate file {}: {}", path.display(), e),
            }
        }
    }
}

/// An ordered chain of weighted stages.
///
/// Each stage gets a contiguous slice of the global 0..=100 progress range
/// proportional to its weight. Every stage but the last writes into the
/// scratch directory; those files are deleted when the run ends, whatever
/// its result.
pub struct PipelineComposer {
    steps: Vec<PipelineStep>,
    scratch_dir: PathBuf,
}

impl PipelineComposer {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            steps: Vec::new(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn then(mut self, stage: Arc<dyn Stage>, weight: u32) -> Self {
        self.steps.push(PipelineStep { stage, weight });
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.stage.name()).collect()
    }

    /// Global progress range of every stage, normalized so the last one ends
    /// at 100. All-zero weights are treated as equal weights.
    pub fn ranges(&self) -> Vec<(u8, u8)> {
        let weights: Vec<u64> = if self.steps.iter().all(|s| s.weight == 0) {
            vec![1; self.steps.len()]
        } else {
            self.steps.iter().map(|s| s.weight as u64).collect()
        };
        let total: u64 = weights.iter().sum();

        let mut ranges = Vec::with_capacity(weights.len());
        let mut cumulative = 0u64;
        for (i, weight) in weights.iter().enumerate() {
            let start = cumulative * 100 / total;
            cumulative += weight;
            let end = if i + 1 == weights.len() {
                100
            } else {
                cumulative * 100 / total
            };
            ranges.push((start as u8, end as u8));
        }
        ranges
    }

    fn scratch_path(&self, task_id: &str, index: usize, stage: &dyn Stage) -> PathBuf {
        self.scratch_dir.join(format!(
            "{}-{}-{}.{}",
            task_id,
            index,
            stage.name(),
            stage.output_extension()
        ))
    }

    /// Runs all stages in order, stopping at the first failure.
    pub async fn run(
        &self,
        task_id: &str,
        input: &Path,
        output: &Path,
        config: &StageConfig,
        report: ReportFn<'_>,
    ) -> PipelineOutcome {
        if self.steps.is_empty() {
            return PipelineOutcome::failed("pipeline", "Pipeline has no stages");
        }

        let mut scratch = ScratchFiles { paths: Vec::new() };
        if self.steps.len() > 1 {
            if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
                return PipelineOutcome::failed(
                    "pipeline",
                    format!("Failed to create scratch directory {}: {}", self.scratch_dir.display(), e),
                );
            }
        }

        let ranges = self.ranges();
        let last = self.steps.len() - 1;
        let mut current_input = input.to_path_buf();
        let mut metadata = Metadata::new();
        let mut final_message = String::new();

        for (i, (step, (start, end))) in self.steps.iter().zip(ranges).enumerate() {
            let stage_output = if i == last {
                output.to_path_buf()
            } else {
                let path = self.scratch_path(task_id, i, step.stage.as_ref());
                scratch.track(path.clone());
                path
            };

            let runner = StageRunner::new(step.stage.clone(), start, end);
            info!(
                "Task {} stage {}/{} ({}) covering {}..={}%",
                task_id,
                i + 1,
                self.steps.len(),
                runner.stage_name(),
                start,
                end
            );

            let StageOutcome {
                ok,
                message,
                metadata: stage_metadata,
            } = runner.run(&current_input, &stage_output, config, report).await;
            metadata.insert(runner.stage_name().to_string(), Value::Object(stage_metadata));

            if !ok {
                warn!("Task {} stopped at stage {}: {}", task_id, runner.stage_name(), message);
                metadata.insert("failed_stage".to_string(), Value::from(runner.stage_name()));
                if i == last {
                    // partial final output
                    scratch.track(stage_output);
                }
                return PipelineOutcome {
                    ok: false,
                    message,
                    metadata,
                };
            }

            final_message = message;
            current_input = stage_output;
        }

        PipelineOutcome {
            ok: true,
            message: final_message,
            metadata,
        }
    }
}

/// Stage implementations available to the dispatcher.
pub struct StageCatalog {
    extractor: Arc<dyn Stage>,
    transcribers: HashMap<Engine, Arc<dyn Stage>>,
}

impl StageCatalog {
    pub fn new(extractor: Arc<dyn Stage>) -> Self {
        Self {
            extractor,
            transcribers: HashMap::new(),
        }
    }

    pub fn with_transcriber(mut self, engine: Engine, stage: Arc<dyn Stage>) -> Self {
        info!("Registering transcription engine: {}", engine);
        self.transcribers.insert(engine, stage);
        self
    }

    pub fn has_engine(&self, engine: Engine) -> bool {
        self.transcribers.contains_key(&engine)
    }

    pub fn engines(&self) -> Vec<Engine> {
        let mut engines: Vec<Engine> = self.transcribers.keys().copied().collect();
        engines.sort_by_key(|e| e.as_str());
        engines
    }

    fn transcriber(&self, engine: Option<Engine>) -> Result<Arc<dyn Stage>> {
        let engine = engine.ok_or_else(|| anyhow::anyhow!("No transcription engine selected"))?;
        self.transcribers
            .get(&engine)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Transcription engine {} is not available", engine))
    }

    /// Builds the pipeline for a conversion kind.
    pub fn compose(
        &self,
        kind: ConversionKind,
        engine: Option<Engine>,
        scratch_dir: &Path,
    ) -> Result<PipelineComposer> {
        let pipeline = PipelineComposer::new(scratch_dir);
        Ok(match kind {
            ConversionKind::Mp4ToMp3 => pipeline.then(self.extractor.clone(), 100),
            ConversionKind::Mp3ToTxt => pipeline.then(self.transcriber(engine)?, 100),
            ConversionKind::Mp4ToTxt => pipeline
                .then(self.extractor.clone(), 50)
                .then(self.transcriber(engine)?, 50),
        })
    }
}
