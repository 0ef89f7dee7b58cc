use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::schedule::scheduler::TaskRegistry;
use crate::schedule::types::{ConversionKind, TaskSnapshot, TaskStatus};

pub type SubscriberId = u64;
pub type EventSender = mpsc::UnboundedSender<TaskEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TaskEvent>;

/// Per-task event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Snapshot replayed when a subscriber joins.
    #[serde(rename = "conversion_status")]
    Status(TaskSnapshot),
    #[serde(rename = "conversion_progress")]
    Progress {
        conversion_id: String,
        progress: u8,
        message: String,
        status: TaskStatus,
    },
    #[serde(rename = "conversion_complete")]
    Complete {
        conversion_id: String,
        success: bool,
        message: String,
        output_file: Option<String>,
        error: Option<String>,
    },
    Error {
        conversion_id: String,
        message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Status(task) => &task.id,
            TaskEvent::Progress { conversion_id, .. }
            | TaskEvent::Complete { conversion_id, .. }
            | TaskEvent::Error { conversion_id, .. } => conversion_id,
        }
    }
}

/// Change to the set of known tasks, sent on the global channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ListChange {
    Created {
        conversion_id: String,
        filename: String,
        kind: ConversionKind,
    },
    Finished {
        conversion_id: String,
        success: bool,
    },
}

/// Fans task events out to per-task subscribers.
///
/// Each subscriber owns an unbounded channel, so a slow reader never stalls
/// the worker that publishes. Joining replays the current snapshot while the
/// subscriber lock is held, which orders it before any later publish.
pub struct ProgressBroadcaster {
    registry: Arc<TaskRegistry>,
    subscribers: Mutex<HashMap<String, Vec<(SubscriberId, EventSender)>>>,
    next_id: AtomicU64,
    list_tx: broadcast::Sender<ListChange>,
}

impl ProgressBroadcaster {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self::with_list_capacity(registry, 256)
    }

    pub fn with_list_capacity(registry: Arc<TaskRegistry>, capacity: usize) -> Self {
        let (list_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            list_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriberId, EventSender)>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `sender` for events of `task_id`. If the task is known its
    /// snapshot is delivered first.
    pub fn subscribe(&self, task_id: &str, sender: EventSender) -> SubscriberId {
        let mut subscribers = self.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(snapshot) = self.registry.get(task_id) {
            if sender.send(TaskEvent::Status(snapshot)).is_err() {
                debug!("Subscriber {} for {} closed before replay", id, task_id);
                return id;
            }
        }

        subscribers.entry(task_id.to_string()).or_default().push((id, sender));
        debug!("Subscriber {} joined {}", id, task_id);
        id
    }

    /// Convenience wrapper that creates the channel as well.
    pub fn subscribe_channel(&self, task_id: &str) -> (SubscriberId, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(task_id, tx), rx)
    }

    pub fn unsubscribe(&self, task_id: &str, subscriber: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(task_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != subscriber);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(task_id);
        }
        removed
    }

    /// Delivers `event` to every current subscriber of `task_id`, dropping
    /// the ones whose receiver is gone.
    pub fn publish(&self, task_id: &str, event: TaskEvent) {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(task_id) else {
            return;
        };

        list.retain(|(id, sender)| match sender.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping closed subscriber {} of {}", id, task_id);
                false
            }
        });
        if list.is_empty() {
            subscribers.remove(task_id);
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.lock().get(task_id).map_or(0, Vec::len)
    }

    /// Forgets every subscriber of a task that is no longer tracked.
    pub fn drop_task(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    pub fn watch_list(&self) -> broadcast::Receiver<ListChange> {
        self.list_tx.subscribe()
    }

    pub fn notify_list(&self, change: ListChange) {
        // no receivers is fine
        let _ = self.list_tx.send(change);
    }
}
