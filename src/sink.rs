//! Append-only JSON-lines event log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::event::LogRecord;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot write `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write-only handle on the event log.
///
/// Clones share the same lock, so lines from concurrent writers never
/// interleave and land in arrival order.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl LogSink {
    /// Create parent directories and check the file accepts appends.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| SinkError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io)?;
        }
        append_options().open(&path).await.map_err(io)?;

        tracing::info!(path = %path.display(), "event log opened");

        Ok(Self {
            lock: Arc::new(Mutex::new(())),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and wait until it reaches storage.
    pub async fn append(&self, record: &LogRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let io = |source| SinkError::Io {
            path: self.path.to_path_buf(),
            source,
        };

        let _guard = self.lock.lock().await;
        let mut file = append_options().open(self.path.as_ref()).await.map_err(io)?;
        file.write_all(&line).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        file.sync_data().await.map_err(io)?;

        Ok(())
    }
}

fn append_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    options
}
