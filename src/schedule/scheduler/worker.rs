use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use super::TaskRegistry;
use crate::schedule::broadcast::{ListChange, ProgressBroadcaster, TaskEvent};
use crate::schedule::history::{ConversionLog, HistoryLog};
use crate::schedule::pipeline::{PipelineOutcome, StageCatalog};
use crate::schedule::retention::RetentionCleaner;
use crate::schedule::stage::StageConfig;
use crate::schedule::types::{HistoryEntry, Task, TransitionError};

/// Drives one task from `Pending` to a terminal state.
#[derive(Clone)]
pub struct TaskWorker {
    pub(super) registry: Arc<TaskRegistry>,
    pub(super) broadcaster: Arc<ProgressBroadcaster>,
    pub(super) history: Arc<HistoryLog>,
    pub(super) conversion_log: Option<Arc<ConversionLog>>,
    pub(super) retention: RetentionCleaner,
    pub(super) catalog: Arc<StageCatalog>,
    pub(super) scratch_dir: PathBuf,
}

impl TaskWorker {
    pub async fn run(&self, task_id: &str, output: PathBuf) {
        let task = match self.registry.update(task_id, |t| t.start().map(|_| t.clone())) {
            Some(Ok(task)) => task,
            Some(Err(e)) => {
                warn!("Not starting task: {}", e);
                return;
            }
            None => {
                warn!("Task {} vanished before it could start", task_id);
                return;
            }
        };

        info!("Processing {} task: {}", task.kind, task_id);
        self.publish_progress(task_id);

        let outcome = self.execute(&task, &output).await;
        self.finish(task_id, output, outcome);
    }

    async fn execute(&self, task: &Task, output: &Path) -> PipelineOutcome {
        let pipeline = match self.catalog.compose(task.kind, task.engine, &self.scratch_dir) {
            Ok(pipeline) => pipeline,
            Err(e) => return PipelineOutcome::failed("pipeline", format!("{:#}", e)),
        };

        if let Some(parent) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return PipelineOutcome::failed(
                    "pipeline",
                    format!("Failed to create output directory {}: {}", parent.display(), e),
                );
            }
        }

        let task_id = task.id.as_str();
        let config = Self::stage_config(task);
        let report = |percent: u8, message: &str| {
            let accepted = self
                .registry
                .update(task_id, |t| t.record_progress(percent, message))
                .unwrap_or(false);
            if accepted {
                self.publish_progress(task_id);
            }
        };
        pipeline
            .run(task_id, &task.input_path, output, &config, &report)
            .await
    }

    fn stage_config(task: &Task) -> StageConfig {
        let mut config = StageConfig::new();
        config.insert("task_id".to_string(), Value::from(task.id.as_str()));
        if let Some(language) = &task.language {
            config.insert("language".to_string(), Value::from(language.as_str()));
        }
        config
    }

    fn publish_progress(&self, task_id: &str) {
        if let Some(task) = self.registry.get(task_id) {
            self.broadcaster.publish(
                task_id,
                TaskEvent::Progress {
                    conversion_id: task.id,
                    progress: task.progress,
                    message: task.message,
                    status: task.status,
                },
            );
        }
    }

    fn finish(&self, task_id: &str, output: PathBuf, outcome: PipelineOutcome) {
        let PipelineOutcome { ok, message, metadata } = outcome;
        let transition = self.registry.update(task_id, |t| -> Result<Task, TransitionError> {
            if ok {
                t.complete(output, message, metadata)?;
            } else {
                t.fail(message, metadata)?;
            }
            Ok(t.clone())
        });

        let task = match transition {
            Some(Ok(task)) => task,
            Some(Err(e)) => {
                error!("Failed to record result of task {}: {}", task_id, e);
                return;
            }
            None => {
                warn!("Task {} vanished before it finished", task_id);
                return;
            }
        };

        if ok {
            info!("Task {} completed: {}", task_id, task.message);
            if let Some(log) = &self.conversion_log {
                if let Err(e) = log.record(&task) {
                    warn!("Failed to write conversion log {}: {:#}", log.path().display(), e);
                }
            }
        } else {
            error!("Failed to process task {}: {}", task_id, task.message);
            self.broadcaster.publish(
                task_id,
                TaskEvent::Error {
                    conversion_id: task.id.clone(),
                    message: task.message.clone(),
                },
            );
        }

        self.broadcaster.publish(
            task_id,
            TaskEvent::Complete {
                conversion_id: task.id.clone(),
                success: ok,
                message: task.message.clone(),
                output_file: task.output_file_name(),
                error: task.error.clone(),
            },
        );

        self.history.append(HistoryEntry::from_task(&task));
        self.broadcaster.notify_list(ListChange::Finished {
            conversion_id: task.id.clone(),
            success: ok,
        });
        self.retention.schedule(task.input_path);
    }
}
