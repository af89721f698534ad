use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fs2::FileExt;
use tokio::task::JoinHandle;

use crate::fetch::{AbortSignal, Fetcher};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {} is held by another process", .0.display())]
    Busy(PathBuf),

    #[error("cannot open lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide advisory lock guarding a whole sync pass.
///
/// Released when dropped.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: File,
}

impl ProcessLock {
    /// Take the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Busy(path.to_path_buf()));
        }

        tracing::debug!(path = %path.display(), "acquired sync lock");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "cannot release sync lock: {e}");
        }
    }
}

/// Background poll of a repository's download lock marker.
///
/// If the marker shows up while a transfer is running, the watch raises the
/// abort signal it was given. The task is stopped by `stop` or on drop.
pub struct LockWatch {
    handle: Option<JoinHandle<()>>,
    tripped: Arc<AtomicBool>,
}

impl LockWatch {
    pub fn spawn(
        fetcher: Arc<dyn Fetcher>,
        lock_url: String,
        interval: Duration,
        abort: AbortSignal,
    ) -> Self {
        let tripped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&tripped);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the lock was just checked.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if abort.is_raised() {
                    break;
                }
                if fetcher.fetch_text(&lock_url).await.is_some() {
                    tracing::warn!(url = %lock_url, "repository locked during download, aborting");
                    flag.store(true, Ordering::SeqCst);
                    abort.raise();
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
            tripped,
        }
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Stop polling and wait for the task. Returns whether the lock appeared.
    pub async fn stop(mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.tripped()
    }
}

impl Drop for LockWatch {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
