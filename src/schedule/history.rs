use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::schedule::types::{ConversionKind, HistoryEntry, Metadata, Task};

struct Inner {
    entries: VecDeque<HistoryEntry>,
    total: usize,
    capacity: usize,
}

/// Bounded log of finished tasks. The oldest entries are evicted once
/// `capacity` is reached; `total` keeps counting every append.
pub struct HistoryLog {
    inner: Mutex<Inner>,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                total: 0,
                capacity,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, entry: HistoryEntry) {
        let mut inner = self.lock();
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        inner.total += 1;
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let inner = self.lock();
        let skip = inner.entries.len().saturating_sub(limit);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn total(&self) -> usize {
        self.lock().total
    }
}

#[derive(Serialize)]
struct ConversionRecord<'a> {
    timestamp: DateTime<Utc>,
    conversion_id: &'a str,
    kind: ConversionKind,
    input_file: String,
    output_file: Option<String>,
    metadata: &'a Metadata,
}

/// Append-only JSON Lines file with one record per successful conversion.
/// Unlike [`HistoryLog`] it survives restarts.
pub struct ConversionLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl ConversionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, task: &Task) -> Result<()> {
        let record = ConversionRecord {
            timestamp: task.ended_at.unwrap_or_else(Utc::now),
            conversion_id: &task.id,
            kind: task.kind,
            input_file: task.input_path.display().to_string(),
            output_file: task.output_path.as_ref().map(|p| p.display().to_string()),
            metadata: &task.metadata,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
