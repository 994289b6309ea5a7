use crate::sink::{LogSink, SinkHandle};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ExitInfo, Phase, ProcessSpec, Result, RunState, TetherError, HISTORY_LIMIT};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a forced kill may take before it is retried.
const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);
const FORCE_KILL_ATTEMPTS: u32 = 3;
/// Grandchildren can keep the pipes open after the child itself is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What a call to [`ProcessRunner::stop`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    AlreadyStopped,
    /// A scheduled restart was cancelled.
    Cancelled,
    /// The child exited within the grace period.
    Graceful,
    /// The grace period elapsed and the child was killed.
    Escalated,
}

/// Owns one unit's child process, its log sink handle and its [`RunState`].
pub struct ProcessRunner {
    spec: Arc<ProcessSpec>,
    sink: LogSink,
    state: RunState,
    child: Option<Child>,
    pump: Option<JoinHandle<SinkHandle>>,
}

impl ProcessRunner {
    pub fn new(spec: Arc<ProcessSpec>, sink: LogSink) -> Self {
        let state = RunState::new(spec.name.clone());
        Self {
            spec,
            sink,
            state,
            child: None,
            pump: None,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the unit from `STOPPED`.
    pub async fn start(&mut self) -> Result<()> {
        self.state.transition(Phase::Starting)?;
        self.launch().await
    }

    /// Spawn the unit again after a crash, counting the restart.
    pub async fn respawn(&mut self) -> Result<()> {
        self.state.transition(Phase::Starting)?;
        self.state.record_restart(Utc::now());
        self.launch().await
    }

    async fn launch(&mut self) -> Result<()> {
        let handle = match self.sink.open(&self.spec).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.abort_start(e)),
        };

        let (program, argv) = self.spec.command_line();
        let mut command = Command::new(&program);
        command
            .args(&argv)
            .envs(&self.spec.env)
            .current_dir(&self.spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Err(close_err) = handle.close().await {
                    warn!(unit = %self.spec.name, error = %close_err, "Failed to close log sink");
                }
                let err = TetherError::Spawn(format!("{}: {}", program.display(), e));
                return Err(self.abort_start(err));
            }
        };

        let pid = child.id().unwrap_or_default();
        let run_id = Uuid::new_v4();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.pump = Some(tokio::spawn(pump(handle, stdout, stderr)));
        self.child = Some(child);

        self.state.record_start(pid, run_id, Utc::now());
        self.state.transition(Phase::Running)?;

        info!(
            unit = %self.spec.name,
            pid,
            run_id = %run_id,
            restarts = self.state.restarts,
            "Unit started"
        );
        Ok(())
    }

    fn abort_start(&mut self, err: TetherError) -> TetherError {
        error!(unit = %self.spec.name, error = %err, "Unit failed to start");
        self.state.last_error = Some(err.to_string());
        if let Err(e) = self.state.transition(Phase::Stopped) {
            error!(unit = %self.spec.name, error = %e, "Unexpected phase after failed start");
        }
        err
    }

    /// Wait for the child to exit. Pending forever when there is no child.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => std::future::pending().await,
        }
    }

    /// Record a child exit, release the sink and pick the next phase.
    pub async fn observe_exit(&mut self, exit: ExitInfo) -> Phase {
        self.child = None;
        self.state.record_exit(exit, Utc::now());
        self.release_sink().await;

        let next = if self.state.phase == Phase::Stopping {
            Phase::Stopped
        } else {
            Phase::Crashed
        };
        if let Err(e) = self.state.transition(next) {
            error!(unit = %self.spec.name, error = %e, "Unexpected exit notification");
        }

        info!(unit = %self.spec.name, exit = %exit, phase = %self.state.phase, "Unit exited");
        self.state.phase
    }

    async fn release_sink(&mut self) {
        let Some(mut pump) = self.pump.take() else {
            return;
        };

        match tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await {
            Ok(Ok(handle)) => {
                if let Err(e) = handle.close().await {
                    warn!(unit = %self.spec.name, error = %e, "Failed to flush logs");
                }
            }
            Ok(Err(e)) => {
                error!(unit = %self.spec.name, error = %e, "Log pump failed");
            }
            Err(_) => {
                warn!(unit = %self.spec.name, "Output still open after exit, dropping log pump");
                pump.abort();
                let _ = pump.await;
            }
        }
    }

    /// Stop the unit, escalating to SIGKILL once `timeout` has elapsed.
    pub async fn stop(&mut self, timeout: Duration) -> Result<StopOutcome> {
        match self.state.phase {
            Phase::Stopped | Phase::Failed => return Ok(StopOutcome::AlreadyStopped),
            Phase::Crashed => {
                self.state.transition(Phase::Stopped)?;
                info!(unit = %self.spec.name, "Pending restart cancelled");
                return Ok(StopOutcome::Cancelled);
            }
            Phase::Starting | Phase::Running => self.state.transition(Phase::Stopping)?,
            Phase::Stopping => {}
        }

        let Some(pid) = self.state.pid else {
            self.state.transition(Phase::Stopped)?;
            return Ok(StopOutcome::AlreadyStopped);
        };

        debug!(unit = %self.spec.name, pid, "Sending SIGTERM");
        if let Err(e) = signal_group(pid, Signal::SIGTERM) {
            warn!(unit = %self.spec.name, pid, error = %e, "Failed to send SIGTERM");
        }

        if let Some(status) = self.wait_for(timeout).await {
            self.observe_exit(status.into()).await;
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            unit = %self.spec.name,
            pid,
            timeout_ms = timeout.as_millis() as u64,
            "Grace period elapsed, escalating to SIGKILL"
        );

        for attempt in 1..=FORCE_KILL_ATTEMPTS {
            if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                warn!(unit = %self.spec.name, pid, attempt, error = %e, "Failed to send SIGKILL");
            }
            if let Some(child) = self.child.as_mut() {
                if let Err(e) = child.start_kill() {
                    warn!(unit = %self.spec.name, pid, attempt, error = %e, "Failed to kill child");
                }
            }
            if let Some(status) = self.wait_for(FORCE_KILL_GRACE).await {
                self.observe_exit(status.into()).await;
                return Ok(StopOutcome::Escalated);
            }
        }

        Err(TetherError::TimeoutEscalated {
            name: self.spec.name.clone(),
            attempts: FORCE_KILL_ATTEMPTS,
        })
    }

    async fn wait_for(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(unit = %self.spec.name, error = %e, "Failed to wait for child");
                None
            }
            Err(_) => None,
        }
    }

    /// Forget restarts older than `window` before the last exit. Without a
    /// window only the usual history length is kept.
    pub fn prune_restarts(&mut self, window: Option<Duration>) {
        let Some(window) = window else {
            self.state.trim_restarts(HISTORY_LIMIT);
            return;
        };
        let since = chrono::Duration::from_std(window)
            .ok()
            .zip(self.state.last_exited_at)
            .and_then(|(window, exited_at)| exited_at.checked_sub_signed(window));
        if let Some(since) = since {
            self.state.forget_restarts_before(since);
        }
    }

    /// The restart policy gave up on the unit.
    pub fn mark_failed(&mut self) -> Result<()> {
        self.state.transition(Phase::Failed)?;
        let detail = match self.state.last_exit {
            Some(exit) => format!("gave up after {} restarts, last exit {}", self.state.restarts, exit),
            None => format!("gave up after {} restarts", self.state.restarts),
        };
        let err = TetherError::RuntimeCrash {
            name: self.spec.name.clone(),
            detail,
        };
        self.state.last_error = Some(err.to_string());
        Ok(())
    }

    /// The exit was expected; rest in `STOPPED`.
    pub fn settle(&mut self) -> Result<()> {
        self.state.transition(Phase::Stopped)
    }

    /// Operator reset: leave `FAILED` and forget the restart history.
    pub fn reset(&mut self) -> Result<()> {
        if self.state.phase == Phase::Failed {
            self.state.transition(Phase::Stopped)?;
        }
        self.state.reset_restarts();
        Ok(())
    }
}

fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Copy the child's output into the sink until both pipes are closed.
async fn pump(
    mut handle: SinkHandle,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
) -> SinkHandle {
    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) => stdout = None,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdout");
                    stdout = None;
                }
                Ok(n) => {
                    if let Err(e) = handle.write_stdout(&out_buf[..n]).await {
                        warn!(error = %e, "Failed to write stdout log");
                    }
                }
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) => stderr = None,
                Err(e) => {
                    warn!(error = %e, "Failed to read stderr");
                    stderr = None;
                }
                Ok(n) => {
                    if let Err(e) = handle.write_stderr(&err_buf[..n]).await {
                        warn!(error = %e, "Failed to write stderr log");
                    }
                }
            },
        }
    }

    handle
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader.as_mut() {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tether_core::RestartSettings;

    fn create_test_spec(dir: &Path, body: &str) -> ProcessSpec {
        let script = dir.join("unit.sh");
        std::fs::write(&script, body).unwrap();
        ProcessSpec {
            name: "w".to_string(),
            script,
            interpreter: Some(PathBuf::from("/bin/sh")),
            interpreter_args: vec![],
            args: vec![],
            env: BTreeMap::new(),
            cwd: dir.to_path_buf(),
            out_log: dir.join("logs/w-out.log"),
            err_log: dir.join("logs/w-error.log"),
            truncate_logs: false,
            kill_timeout: Duration::from_millis(500),
            restart: RestartSettings::default(),
        }
    }

    fn runner(spec: ProcessSpec) -> (ProcessRunner, LogSink) {
        let sink = LogSink::new();
        (ProcessRunner::new(Arc::new(spec), sink.clone()), sink)
    }

    async fn wait_for_log(path: &Path, needle: &str) {
        for _ in 0..100 {
            if std::fs::read_to_string(path)
                .map(|s| s.contains(needle))
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never appeared in {}", needle, path.display());
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let dir = TempDir::new().unwrap();
        let (mut runner, sink) = runner(create_test_spec(dir.path(), "exec sleep 30\n"));

        runner.start().await.unwrap();
        assert_eq!(runner.phase(), Phase::Running);
        assert!(runner.state().pid.unwrap() > 0);
        assert_eq!(sink.open_handles(), 1);

        let outcome = runner.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(runner.phase(), Phase::Stopped);
        assert_eq!(runner.state().pid, None);
        assert_eq!(runner.state().last_exit, Some(ExitInfo::signal(15)));
        assert_eq!(sink.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        let dir = TempDir::new().unwrap();
        let spec = create_test_spec(dir.path(), "trap '' TERM\necho ready\nsleep 30\n");
        let out_log = spec.out_log.clone();
        let (mut runner, sink) = runner(spec);

        runner.start().await.unwrap();
        wait_for_log(&out_log, "ready").await;

        let outcome = runner.stop(Duration::from_millis(200)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Escalated);
        assert_eq!(runner.phase(), Phase::Stopped);
        assert_eq!(runner.state().last_exit, Some(ExitInfo::signal(9)));
        assert_eq!(sink.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _sink) = runner(create_test_spec(dir.path(), "exit 0\n"));

        let outcome = runner.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert_eq!(runner.phase(), Phase::Stopped);
        assert!(runner.state().history.is_empty());
    }

    #[tokio::test]
    async fn test_unrequested_exit_is_a_crash() {
        let dir = TempDir::new().unwrap();
        let spec = create_test_spec(dir.path(), "echo out\necho err >&2\nexit 3\n");
        let (out_log, err_log) = (spec.out_log.clone(), spec.err_log.clone());
        let (mut runner, sink) = runner(spec);

        runner.start().await.unwrap();
        let status = runner.wait().await.unwrap();
        let phase = runner.observe_exit(status.into()).await;

        assert_eq!(phase, Phase::Crashed);
        assert_eq!(runner.state().last_exit, Some(ExitInfo::code(3)));
        assert_eq!(runner.state().runs.len(), 1);
        assert_eq!(sink.open_handles(), 0);
        assert_eq!(std::fs::read_to_string(out_log).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(err_log).unwrap(), "err\n");

        runner.respawn().await.unwrap();
        assert_eq!(runner.state().restarts, 1);
        let status = runner.wait().await.unwrap();
        runner.observe_exit(status.into()).await;
        runner.mark_failed().unwrap();
        assert_eq!(runner.phase(), Phase::Failed);
        let reason = runner.state().last_error.clone().unwrap();
        assert_eq!(reason, "Unit w crashed: gave up after 1 restarts, last exit code 3");

        runner.reset().unwrap();
        assert_eq!(runner.phase(), Phase::Stopped);
        assert_eq!(runner.state().restarts, 0);
    }

    #[test]
    fn test_prune_restarts_follows_window() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _sink) = runner(create_test_spec(dir.path(), "exit 0\n"));
        let now = Utc::now();
        for secs in [120, 90, 30, 5] {
            runner.state.record_restart(now - chrono::Duration::seconds(secs));
        }
        runner.state.last_exited_at = Some(now);

        runner.prune_restarts(Some(Duration::from_secs(60)));
        assert_eq!(runner.state().recent_restarts.len(), 2);
        assert_eq!(runner.state().restarts, 4);

        for _ in 0..100 {
            runner.state.record_restart(now);
        }
        runner.prune_restarts(Some(Duration::from_secs(60)));
        assert_eq!(runner.state().recent_restarts.len(), 102);
        runner.prune_restarts(None);
        assert_eq!(runner.state().recent_restarts.len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let dir = TempDir::new().unwrap();
        let mut spec = create_test_spec(dir.path(), "echo \"$GREETING $HOME_SET\"\n");
        spec.env.insert("GREETING".to_string(), "hello".to_string());
        spec.env.insert("HOME_SET".to_string(), "yes".to_string());
        let out_log = spec.out_log.clone();
        let (mut runner, _sink) = runner(spec);

        runner.start().await.unwrap();
        let status = runner.wait().await.unwrap();
        runner.observe_exit(status.into()).await;

        assert_eq!(std::fs::read_to_string(out_log).unwrap(), "hello yes\n");
    }

    #[tokio::test]
    async fn test_spawn_error_leaves_unit_stopped() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec {
            interpreter: Some(PathBuf::from("/nonexistent/interpreter")),
            ..create_test_spec(dir.path(), "exit 0\n")
        };
        let (mut runner, sink) = runner(spec);

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, TetherError::Spawn(_)));
        assert_eq!(runner.phase(), Phase::Stopped);
        assert!(!runner.has_child());
        assert!(runner.state().last_error.is_some());
        assert_eq!(sink.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_resource_error_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let marker = dir.path().join("spawned");
        let spec = ProcessSpec {
            out_log: blocker.join("out.log"),
            ..create_test_spec(dir.path(), &format!("touch {}\n", marker.display()))
        };
        let (mut runner, sink) = runner(spec);

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, TetherError::Resource(_)));
        assert_eq!(runner.phase(), Phase::Stopped);
        assert_eq!(sink.open_handles(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let (mut runner, _sink) = runner(create_test_spec(dir.path(), "exec sleep 30\n"));

        runner.start().await.unwrap();
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidTransition { .. }));
        runner.stop(Duration::from_secs(5)).await.unwrap();
    }
}
