use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Upper bound on every per-unit history kept in a [`RunState`].
pub const HISTORY_LIMIT: usize = 64;

/// Upper bound on restart timestamps kept for window accounting, and so on
/// the largest `max_restarts` a unit may declare.
pub const RESTART_LOG_LIMIT: usize = 4096;

/// Validated, immutable description of how to launch a unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub interpreter_args: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub out_log: PathBuf,
    pub err_log: PathBuf,
    pub truncate_logs: bool,
    pub kill_timeout: Duration,
    pub restart: RestartSettings,
}

impl ProcessSpec {
    /// Program and argument vector, interpreter first when one is configured.
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        match &self.interpreter {
            Some(interpreter) => {
                let mut argv = self.interpreter_args.clone();
                argv.push(self.script.to_string_lossy().into_owned());
                argv.extend(self.args.iter().cloned());
                (interpreter.clone(), argv)
            }
            None => (self.script.clone(), self.args.clone()),
        }
    }
}

/// How the delay before the next restart is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartStrategy {
    Never,
    Fixed { delay: Duration },
    Exponential { initial: Duration, max_delay: Duration },
}

/// Restart tuning carried by every [`ProcessSpec`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartSettings {
    pub strategy: RestartStrategy,
    pub max_restarts: u32,
    pub window: Duration,
    pub min_uptime: Duration,
    /// Exit codes that mean the unit finished its work.
    pub stop_exit_codes: Vec<i32>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            strategy: RestartStrategy::Exponential {
                initial: Duration::from_millis(100),
                max_delay: Duration::from_secs(15),
            },
            max_restarts: 15,
            window: Duration::from_secs(60),
            min_uptime: Duration::from_secs(1),
            stop_exit_codes: Vec::new(),
        }
    }
}

/// Lifecycle phase of a unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Stopped,
        Phase::Starting,
        Phase::Running,
        Phase::Stopping,
        Phase::Crashed,
        Phase::Failed,
    ];

    /// The transition table of the process state machine.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Starting)
                | (Crashed, Failed)
                | (Crashed, Stopped)
                | (Failed, Stopped)
        )
    }

    /// A settled unit has no child and nothing scheduled.
    pub fn is_settled(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Stopped => "STOPPED",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Stopping => "STOPPING",
            Phase::Crashed => "CRASHED",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// One completed run of a unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub started_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub exit: ExitInfo,
}

impl RunRecord {
    pub fn uptime(&self) -> Duration {
        (self.exited_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// A recorded phase change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

/// Mutable runtime status of one unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub name: String,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub run_id: Option<Uuid>,
    pub restarts: u32,
    pub last_exit: Option<ExitInfo>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_exited_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub recent_restarts: VecDeque<DateTime<Utc>>,
    pub runs: VecDeque<RunRecord>,
    pub history: VecDeque<Transition>,
}

impl RunState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Stopped,
            pid: None,
            run_id: None,
            restarts: 0,
            last_exit: None,
            last_started_at: None,
            last_exited_at: None,
            last_error: None,
            recent_restarts: VecDeque::new(),
            runs: VecDeque::new(),
            history: VecDeque::new(),
        }
    }

    /// Move to `next`, appending the change to the history.
    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TetherError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        push_bounded(
            &mut self.history,
            Transition {
                from: self.phase,
                to: next,
                at: Utc::now(),
            },
        );
        self.phase = next;
        Ok(())
    }

    pub fn record_start(&mut self, pid: u32, run_id: Uuid, at: DateTime<Utc>) {
        self.pid = Some(pid);
        self.run_id = Some(run_id);
        self.last_started_at = Some(at);
        self.last_error = None;
    }

    pub fn record_exit(&mut self, exit: ExitInfo, at: DateTime<Utc>) {
        self.pid = None;
        self.last_exit = Some(exit);
        self.last_exited_at = Some(at);
        if let Some(started_at) = self.last_started_at {
            push_bounded(
                &mut self.runs,
                RunRecord {
                    started_at,
                    exited_at: at,
                    exit,
                },
            );
        }
    }

    pub fn record_restart(&mut self, at: DateTime<Utc>) {
        self.restarts += 1;
        if self.recent_restarts.len() == RESTART_LOG_LIMIT {
            self.recent_restarts.pop_front();
        }
        self.recent_restarts.push_back(at);
    }

    /// Drop restart timestamps older than `since`; they can no longer count against a window.
    pub fn forget_restarts_before(&mut self, since: DateTime<Utc>) {
        while self.recent_restarts.front().map_or(false, |at| *at < since) {
            self.recent_restarts.pop_front();
        }
    }

    /// Keep only the newest `limit` restart timestamps.
    pub fn trim_restarts(&mut self, limit: usize) {
        while self.recent_restarts.len() > limit {
            self.recent_restarts.pop_front();
        }
    }

    /// Operator action: forget the restart history.
    pub fn reset_restarts(&mut self) {
        self.restarts = 0;
        self.recent_restarts.clear();
    }

    /// Restarts applied at or after `since`.
    pub fn restarts_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_restarts.iter().filter(|at| **at >= since).count()
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.runs.back()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T) {
    if queue.len() == HISTORY_LIMIT {
        queue.pop_front();
    }
    queue.push_back(item);
}
