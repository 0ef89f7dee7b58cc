//! Scripted in-process stages for tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ReportFn, Stage, StageConfig, StageOutcome};

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// returns an `ok = false` outcome
    Fail(String),
    /// succeeds for the first `n` runs, then behaves like `Fail`
    FailAfter(usize, String),
    /// returns `Err`
    Error(String),
    Panic(String),
}

pub struct ScriptedStage {
    name: &'static str,
    extension: &'static str,
    reports: Vec<u8>,
    behavior: Behavior,
    gate: Option<Arc<Notify>>,
    runs: AtomicUsize,
    inputs: Mutex<Vec<PathBuf>>,
    outputs: Mutex<Vec<PathBuf>>,
}

impl ScriptedStage {
    pub fn new(name: &'static str, reports: Vec<u8>) -> Self {
        Self {
            name,
            extension: "out",
            reports,
            behavior: Behavior::Succeed,
            gate: None,
            runs: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn extension(mut self, extension: &'static str) -> Self {
        self.extension = extension;
        self
    }

    pub fn behave(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Holds the stage after its reports until the gate is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<PathBuf> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn output_extension(&self) -> &'static str {
        self.extension
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        _config: &StageConfig,
        report: ReportFn<'_>,
    ) -> Result<StageOutcome> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.to_path_buf());
        self.outputs.lock().unwrap().push(output.to_path_buf());

        for percent in &self.reports {
            report(*percent, &format!("{} {}%", self.name, percent));
        }

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let behavior = match &self.behavior {
            Behavior::FailAfter(n, message) if run >= *n => Behavior::Fail(message.clone()),
            Behavior::FailAfter(..) => Behavior::Succeed,
            other => other.clone(),
        };

        match behavior {
            Behavior::Succeed | Behavior::FailAfter(..) => {
                tokio::fs::write(output, format!("{} output", self.name)).await?;
                Ok(StageOutcome::success(format!("{} finished", self.name))
                    .with_metadata("stage", self.name))
            }
            Behavior::Fail(message) => {
                // leave a partial artifact behind
                tokio::fs::write(output, "partial").await?;
                Ok(StageOutcome::failure(message).with_metadata("cause", "scripted"))
            }
            Behavior::Error(message) => Err(anyhow::anyhow!("{}", message)),
            Behavior::Panic(message) => panic!("{}", message),
        }
    }
}
