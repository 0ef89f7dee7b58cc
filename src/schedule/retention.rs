use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Deletes files some time after they were produced.
///
/// Deletions live only in memory; anything scheduled before a restart is
/// left on disk.
#[derive(Debug, Clone)]
pub struct RetentionCleaner {
    window: Duration,
}

impl RetentionCleaner {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedules `path` for deletion after the configured window.
    pub fn schedule(&self, path: PathBuf) -> JoinHandle<()> {
        Self::schedule_delete(path, self.window)
    }

    pub fn schedule_delete(path: PathBuf, after: Duration) -> JoinHandle<()> {
        debug!("Scheduling {} for deletion in {:?}", path.display(), after);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;

            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!("{} already gone", path.display());
                return;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Removed expired file {}", path.display()),
                Err(e) => warn!("Failed to remove expired file {}: {}", path.display(), e),
            }
        })
    }
}
