use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{ProcessSpec, Result, TetherError};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Opens the per-unit output files and keeps count of live handles
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    open: Arc<AtomicUsize>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`SinkHandle`]s not yet closed or dropped.
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Open both log files of a unit, creating parent directories as needed.
    pub async fn open(&self, spec: &ProcessSpec) -> Result<SinkHandle> {
        let stdout = open_log(&spec.out_log, spec.truncate_logs).await?;
        // A shared file must not be truncated twice.
        let truncate_err = spec.truncate_logs && spec.err_log != spec.out_log;
        let stderr = open_log(&spec.err_log, truncate_err).await?;

        self.open.fetch_add(1, Ordering::SeqCst);
        debug!(unit = %spec.name, out = %spec.out_log.display(), err = %spec.err_log.display(), "Opened log sink");

        Ok(SinkHandle {
            stdout: BufWriter::new(stdout),
            stderr: BufWriter::new(stderr),
            _guard: HandleGuard(self.open.clone()),
        })
    }
}

async fn open_log(path: &Path, truncate: bool) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            TetherError::Resource(format!(
                "Cannot create log directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| TetherError::Resource(format!("Cannot open log {}: {}", path.display(), e)))?;

    // Stay in append mode so a file shared by both streams never overwrites itself.
    if truncate {
        file.set_len(0).await.map_err(|e| {
            TetherError::Resource(format!("Cannot truncate log {}: {}", path.display(), e))
        })?;
    }

    Ok(file)
}

struct HandleGuard(Arc<AtomicUsize>);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The two open output streams of one running unit
pub struct SinkHandle {
    stdout: BufWriter<File>,
    stderr: BufWriter<File>,
    _guard: HandleGuard,
}

impl SinkHandle {
    pub async fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdout.write_all(bytes).await
    }

    pub async fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stderr.write_all(bytes).await
    }

    /// Flush and sync both streams, then release the files.
    pub async fn close(mut self) -> io::Result<()> {
        let out = finish(&mut self.stdout).await;
        let err = finish(&mut self.stderr).await;
        out.and(err)
    }
}

async fn finish(stream: &mut BufWriter<File>) -> io::Result<()> {
    stream.flush().await?;
    stream.get_ref().sync_all().await
}
