use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::schedule::types::{Task, TaskSnapshot, TaskSpec};

/// Concurrent store of every known task.
///
/// Callers only ever see clones; mutation goes through [`TaskRegistry::update`],
/// which runs the mutator under the write lock so each update is atomic per
/// task.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Task>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Task>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a `Pending` task and returns its id.
    pub fn create(&self, spec: TaskSpec) -> String {
        let mut tasks = self.write();
        let id = loop {
            let candidate = format!("task-{}", Uuid::new_v4());
            if !tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        info!("Creating new task: {} ({}, {})", id, spec.kind, spec.filename);
        tasks.insert(id.clone(), Task::new(id.clone(), spec));
        id
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.read().get(task_id).cloned()
    }

    /// Applies `mutator` to the task, returning its result, or `None` if the
    /// task is unknown.
    pub fn update<F, R>(&self, task_id: &str, mutator: F) -> Option<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        self.write().get_mut(task_id).map(mutator)
    }

    /// Tasks that have not reached a terminal state, oldest first.
    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        let mut active: Vec<TaskSnapshot> = self
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|t| t.created_at);
        active
    }

    /// Drops terminal tasks that ended more than `older_than` ago and returns
    /// their ids.
    pub fn prune_finished(&self, older_than: Duration) -> Vec<String> {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.write();
        let expired: Vec<String> = tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.ended_at.is_some_and(|end| end < cutoff))
            .map(|t| t.id.clone())
            .collect();

        for id in &expired {
            tasks.remove(id);
            debug!("Pruned finished task {}", id);
        }
        expired
    }
}
