mod registry;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use registry::TaskRegistry;
use worker::TaskWorker;

use crate::schedule::broadcast::{ListChange, ProgressBroadcaster};
use crate::schedule::history::{ConversionLog, HistoryLog};
use crate::schedule::pipeline::StageCatalog;
use crate::schedule::retention::RetentionCleaner;
use crate::schedule::types::{ConversionKind, Engine, HistoryEntry, MediaType, TaskSnapshot, TaskSpec};

/// Reasons a submission is rejected before any task exists.
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),
    #[error("{kind} expects {expected} input, got {filename}")]
    KindMismatch {
        kind: String,
        expected: String,
        filename: String,
    },
    #[error("{0} requires a transcription engine")]
    MissingEngine(String),
    #[error("Transcription engine {0} is not available")]
    EngineUnavailable(Engine),
    #[error("Input file not found: {}", .0.display())]
    InputNotFound(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub max_concurrent_jobs: usize,
    pub retention: Duration,
    pub history_capacity: usize,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveTasks {
    pub active: Vec<TaskSnapshot>,
    pub history_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub total: usize,
}

/// Accepts conversion requests and runs them in the background.
///
/// Every accepted task gets its own tokio task, gated by a semaphore so at
/// most `max_concurrent_jobs` pipelines run at once.
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    history: Arc<HistoryLog>,
    conversion_log: Option<Arc<ConversionLog>>,
    retention: RetentionCleaner,
    catalog: Arc<StageCatalog>,
    permits: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    output_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(catalog: StageCatalog, options: DispatcherOptions) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let max_concurrent_jobs = options.max_concurrent_jobs.max(1);
        Self {
            broadcaster: Arc::new(ProgressBroadcaster::new(registry.clone())),
            registry,
            history: Arc::new(HistoryLog::new(options.history_capacity)),
            conversion_log: None,
            retention: RetentionCleaner::new(options.retention),
            catalog: Arc::new(catalog),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs)),
            max_concurrent_jobs,
            output_dir: options.output_dir,
            scratch_dir: options.scratch_dir,
        }
    }

    /// Also append every successful conversion to `path` as a JSON line.
    pub fn with_conversion_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.conversion_log = Some(Arc::new(ConversionLog::new(path)));
        self
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn engines(&self) -> Vec<Engine> {
        self.catalog.engines()
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Jobs currently holding a worker slot.
    pub fn running_jobs(&self) -> usize {
        self.max_concurrent_jobs - self.permits.available_permits()
    }

    fn validate(&self, spec: &TaskSpec) -> Result<(), SubmitError> {
        let media = MediaType::from_path(Path::new(&spec.filename));
        if media == MediaType::Unknown {
            return Err(SubmitError::UnsupportedFile(spec.filename.clone()));
        }

        let expected = spec.kind.input_media();
        if media != expected {
            return Err(SubmitError::KindMismatch {
                kind: spec.kind.to_string(),
                expected: expected.to_string(),
                filename: spec.filename.clone(),
            });
        }

        if spec.kind.needs_engine() {
            let engine = spec
                .engine
                .ok_or_else(|| SubmitError::MissingEngine(spec.kind.to_string()))?;
            if !self.catalog.has_engine(engine) {
                return Err(SubmitError::EngineUnavailable(engine));
            }
        }

        if !spec.input_path.is_file() {
            return Err(SubmitError::InputNotFound(spec.input_path.clone()));
        }
        Ok(())
    }

    /// `<output_dir>/<task_id>/<input stem>.<ext>`, so no two tasks share an
    /// output file even when their inputs have the same name.
    fn output_path(&self, task_id: &str, input: &Path, kind: ConversionKind) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        self.output_dir
            .join(task_id)
            .join(format!("{}.{}", stem, kind.output_extension()))
    }

    fn worker(&self) -> TaskWorker {
        TaskWorker {
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
            history: self.history.clone(),
            conversion_log: self.conversion_log.clone(),
            retention: self.retention.clone(),
            catalog: self.catalog.clone(),
            scratch_dir: self.scratch_dir.clone(),
        }
    }

    /// Validates and registers a task, then schedules it. Returns as soon as
    /// the task is registered.
    pub fn submit(&self, spec: TaskSpec) -> Result<String, SubmitError> {
        self.validate(&spec)?;

        let filename = spec.filename.clone();
        let kind = spec.kind;
        let input_path = spec.input_path.clone();
        let task_id = self.registry.create(spec);
        let output = self.output_path(&task_id, &input_path, kind);
        self.broadcaster.notify_list(ListChange::Created {
            conversion_id: task_id.clone(),
            filename,
            kind,
        });

        let worker = self.worker();
        let permits = self.permits.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool closed, task {} not run: {}", id, e);
                    return;
                }
            };
            worker.run(&id, output).await;
        });

        Ok(task_id)
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.registry.get(task_id)
    }

    pub fn list_active(&self) -> ActiveTasks {
        ActiveTasks {
            active: self.registry.list_active(),
            history_count: self.history.total(),
        }
    }

    pub fn history(&self, limit: usize) -> HistoryPage {
        HistoryPage {
            entries: self.history.recent(limit),
            total: self.history.total(),
        }
    }

    /// Drops finished tasks older than the retention window.
    pub fn prune(&self) -> usize {
        let window = chrono::Duration::from_std(self.retention.window())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let pruned = self.registry.prune_finished(window);
        for id in &pruned {
            self.broadcaster.drop_task(id);
        }
        if !pruned.is_empty() {
            info!("Pruned {} finished tasks", pruned.len());
        }
        pruned.len()
    }

    /// Runs [`Dispatcher::prune`] every `interval` until the handle is dropped
    /// with the runtime.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let pruned = dispatcher.prune();
                debug!("Maintenance pass done, {} tasks pruned", pruned);
            }
        })
    }
}
