pub mod extract;
pub mod transcribe;

#[cfg(test)]
pub(crate) mod mock;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::schedule::types::Metadata;

pub use extract::{ExtractAudioConfig, ExtractAudioStage};
pub use transcribe::TranscribeStage;

/// Per-run options handed to a stage, e.g. `language`.
pub type StageConfig = serde_json::Map<String, Value>;

/// Progress sink: `(percent 0..=100, message)`.
pub type ReportFn<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutcome {
    pub ok: bool,
    pub message: String,
    pub metadata: Metadata,
}

impl StageOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// One externally implemented conversion step.
///
/// Implementations report local progress in `0..=100` and know nothing about
/// their position inside a pipeline. Returning `Err` is equivalent to an
/// `ok = false` outcome carrying the error text.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension of the file written to `output`.
    fn output_extension(&self) -> &'static str;

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &StageConfig,
        report: ReportFn<'_>,
    ) -> Result<StageOutcome>;
}

/// Runs a stage inside a `[range_start, range_end]` slice of global progress.
pub struct StageRunner {
    stage: Arc<dyn Stage>,
    range_start: u8,
    range_end: u8,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn Stage>, range_start: u8, range_end: u8) -> Self {
        let range_end = range_end.min(100);
        let range_start = range_start.min(range_end);
        Self {
            stage,
            range_start,
            range_end,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        self.stage.name()
    }

    pub fn range(&self) -> (u8, u8) {
        (self.range_start, self.range_end)
    }

    /// Maps a local percentage into the runner's global range.
    pub fn remap(&self, local: u8) -> u8 {
        let start = self.range_start as u32;
        let end = self.range_end as u32;
        let local = local.min(100) as u32;
        let global = start + local * (end - start) / 100;
        global.clamp(start, end) as u8
    }

    /// Runs the stage. Errors and panics inside the stage come back as a
    /// failed outcome.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &StageConfig,
        report: ReportFn<'_>,
    ) -> StageOutcome {
        let forward = |local: u8, message: &str| report(self.remap(local), message);
        let name = self.stage.name();
        debug!(
            "Running stage {} in range {}..={}",
            name, self.range_start, self.range_end
        );

        let result = AssertUnwindSafe(self.stage.run(input, output, config, &forward))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Stage {} returned an error: {:#}", name, e);
                StageOutcome::failure(format!("{:#}", e))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!("Stage {} panicked: {}", name, reason);
                StageOutcome::failure(format!("{} stage crashed: {}", name, reason))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Behavior, ScriptedStage};
    use super::*;
    use std::sync::Mutex;

    fn runner(start: u8, end: u8) -> StageRunner {
        StageRunner::new(Arc::new(ScriptedStage::new("noop", vec![])), start, end)
    }

    #[test]
    fn test_remap_two_halves() {
        let first = runner(0, 50);
        let second = runner(50, 100);
        assert_eq!(first.remap(0), 0);
        assert_eq!(first.remap(100), 50);
        assert_eq!(second.remap(0), 50);
        assert_eq!(second.remap(50), 75);
        assert_eq!(second.remap(100), 100);
    }

    #[test]
    fn test_remap_full_range_is_identity() {
        let full = runner(0, 100);
        for local in 0..=100u8 {
            assert_eq!(full.remap(local), local);
        }
    }

    #[test]
    fn test_remap_clamps_out_of_range_reports() {
        let r = runner(20, 60);
        assert_eq!(r.remap(200), 60);
        assert_eq!(r.remap(0), 20);

        // inverted ranges collapse instead of underflowing
        let r = runner(80, 30);
        assert_eq!(r.range(), (30, 30));
        assert_eq!(r.remap(50), 30);
    }

    #[tokio::test]
    async fn test_runner_forwards_remapped_progress() {
        let stage = Arc::new(ScriptedStage::new("extract", vec![0, 50, 100]));
        let runner = StageRunner::new(stage, 50, 100);
        let seen = Mutex::new(Vec::new());
        let report = |p: u8, _m: &str| seen.lock().unwrap().push(p);

        let dir = tempfile::tempdir().unwrap();
        let outcome = runner
            .run(
                Path::new("in.mp4"),
                &dir.path().join("out.mp3"),
                &StageConfig::new(),
                &report,
            )
            .await;

        assert!(outcome.ok);
        assert_eq!(*seen.lock().unwrap(), vec![50, 75, 100]);
    }

    #[tokio::test]
    async fn test_runner_converts_errors_and_panics() {
        let dir = tempfile::tempdir().unwrap();
        let report = |_p: u8, _m: &str| {};

        let failing = ScriptedStage::new("asr", vec![10]).behave(Behavior::Error("model missing".into()));
        let outcome = StageRunner::new(Arc::new(failing), 0, 100)
            .run(Path::new("a.mp3"), &dir.path().join("a.txt"), &StageConfig::new(), &report)
            .await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("model missing"));

        let crashing = ScriptedStage::new("asr", vec![]).behave(Behavior::Panic("segfault-ish".into()));
        let outcome = StageRunner::new(Arc::new(crashing), 0, 100)
            .run(Path::new("a.mp3"), &dir.path().join("a.txt"), &StageConfig::new(), &report)
            .await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("segfault-ish"));
    }
}
