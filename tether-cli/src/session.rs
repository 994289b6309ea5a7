use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tether_core::{Result, RunState, TetherError};
use tracing::warn;

const STATE_FILE: &str = "tether.state.json";

/// Where a foreground session publishes its units for standalone commands
pub fn state_path(log_dir: &Path) -> PathBuf {
    log_dir.join(STATE_FILE)
}

/// Snapshot written by a running `start`/`restart` session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub units: Vec<RunState>,
}

impl SessionState {
    pub fn new(pid: u32, units: Vec<RunState>) -> Self {
        Self {
            pid,
            updated_at: Utc::now(),
            units,
        }
    }

    /// Replace the file in one rename so readers never see a partial write.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| TetherError::Resource(format!("Cannot encode session state: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// The published state of a session that is still running. Missing,
    /// unreadable and stale files all read as no session.
    pub async fn read_live(path: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(path).await.ok()?;
        let state: Self = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable session state");
                return None;
            }
        };
        state.is_alive().then_some(state)
    }

    pub fn is_alive(&self) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
    }

    pub fn unit(&self, name: &str) -> Option<&RunState> {
        self.units.iter().find(|unit| unit.name == name)
    }

    /// Ask the session to stop its units and exit.
    pub fn terminate(&self) -> Result<()> {
        let pid = i32::try_from(self.pid)
            .map_err(|e| TetherError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| TetherError::Io(io::Error::from(e)))
    }
}

pub async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove session state");
        }
    }
}
