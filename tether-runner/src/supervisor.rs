use crate::policy::{policy_for, RestartDecision, RestartPolicy};
use crate::process::{ProcessRunner, StopOutcome};
use crate::sink::LogSink;
use std::collections::BTreeMap;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ExitInfo, Phase, ProcessSpec, Result, RunState, TetherError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

/// Requests served by a unit worker
enum Command {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<StopOutcome>>,
    },
    Restart {
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct UnitHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RunState>,
    task: JoinHandle<()>,
}

/// Top-level controller for a set of units.
///
/// Each unit is driven by its own worker task, which is the only place its
/// [`RunState`] is mutated. The registry maps unit names to those workers.
pub struct Supervisor {
    registry: Mutex<BTreeMap<String, UnitHandle>>,
    sink: LogSink,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(BTreeMap::new()),
            sink: LogSink::new(),
        }
    }

    /// Register a unit with the policy described by its own settings.
    pub async fn add(&self, spec: ProcessSpec) -> Result<()> {
        let policy = policy_for(&spec.restart);
        self.add_with_policy(spec, policy).await
    }

    pub async fn add_with_policy(
        &self,
        spec: ProcessSpec,
        policy: Arc<dyn RestartPolicy>,
    ) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&spec.name) {
            return Err(TetherError::Validation(format!(
                "Duplicate app name: {}",
                spec.name
            )));
        }

        let name = spec.name.clone();
        let runner = ProcessRunner::new(Arc::new(spec), self.sink.clone());
        let (state_tx, state_rx) = watch::channel(runner.state().clone());
        let (command_tx, command_rx) = mpsc::channel(16);

        let worker = UnitWorker {
            runner,
            policy,
            commands: command_rx,
            state: state_tx,
            restart_at: None,
        };
        let task = tokio::spawn(worker.run());

        registry.insert(
            name.clone(),
            UnitHandle {
                commands: command_tx,
                state: state_rx,
                task,
            },
        );
        info!(unit = %name, "Unit registered");
        Ok(())
    }

    pub async fn names(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }

    /// Start one unit, returning once it is `RUNNING` or the attempt failed.
    pub async fn start(&self, name: &str) -> Result<()> {
        let reply = self.send(name, |reply| Command::Start { reply }).await?;
        reply.await.map_err(|_| TetherError::ShuttingDown)?
    }

    pub async fn start_all(&self) -> Vec<(String, Result<()>)> {
        self.broadcast(|| |reply| Command::Start { reply }).await
    }

    /// Stop one unit. `None` uses the unit's own kill timeout.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<StopOutcome> {
        let reply = self
            .send(name, |reply| Command::Stop { timeout, reply })
            .await?;
        reply.await.map_err(|_| TetherError::ShuttingDown)?
    }

    pub async fn stop_all(&self, timeout: Option<Duration>) -> Vec<(String, Result<StopOutcome>)> {
        self.broadcast(|| move |reply| Command::Stop { timeout, reply })
            .await
    }

    /// Operator restart: stop if needed, forget the restart history, start.
    pub async fn restart(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        let reply = self
            .send(name, |reply| Command::Restart { timeout, reply })
            .await?;
        reply.await.map_err(|_| TetherError::ShuttingDown)?
    }

    /// Snapshots of every unit, ordered by name.
    pub async fn status(&self) -> Vec<RunState> {
        let registry = self.registry.lock().await;
        registry
            .values()
            .map(|unit| unit.state.borrow().clone())
            .collect()
    }

    pub async fn status_of(&self, name: &str) -> Option<RunState> {
        let registry = self.registry.lock().await;
        registry.get(name).map(|unit| unit.state.borrow().clone())
    }

    /// Resolve once every unit is `STOPPED` or `FAILED`.
    pub async fn wait_settled(&self) {
        let receivers: Vec<_> = {
            let registry = self.registry.lock().await;
            registry.values().map(|unit| unit.state.clone()).collect()
        };
        for mut rx in receivers {
            let _ = rx.wait_for(|state| state.phase.is_settled()).await;
        }
    }

    /// Number of log sink handles currently open across all units.
    pub fn open_log_handles(&self) -> usize {
        self.sink.open_handles()
    }

    /// Stop every unit and tear down the registry.
    pub async fn shutdown(self, timeout: Option<Duration>) -> Vec<(String, Result<StopOutcome>)> {
        let results = self.stop_all(timeout).await;
        let units = std::mem::take(&mut *self.registry.lock().await);
        for (name, unit) in units {
            drop(unit.commands);
            if let Err(e) = unit.task.await {
                error!(unit = %name, error = %e, "Unit worker panicked");
            }
        }
        info!("Supervisor shut down");
        results
    }

    async fn send<T>(
        &self,
        name: &str,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let commands = {
            let registry = self.registry.lock().await;
            registry
                .get(name)
                .map(|unit| unit.commands.clone())
                .ok_or_else(|| TetherError::UnitNotFound(name.to_string()))?
        };

        let (tx, rx) = oneshot::channel();
        commands
            .send(command(tx))
            .await
            .map_err(|_| TetherError::ShuttingDown)?;
        Ok(rx)
    }

    /// Send one command to every unit, then collect the replies. Workers run in parallel.
    async fn broadcast<T, F, C>(&self, make: F) -> Vec<(String, Result<T>)>
    where
        F: Fn() -> C,
        C: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let mut pending = Vec::new();
        for name in self.names().await {
            let reply = self.send(&name, make()).await;
            pending.push((name, reply));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (name, reply) in pending {
            let result = match reply {
                Ok(rx) => rx.await.unwrap_or(Err(TetherError::ShuttingDown)),
                Err(e) => Err(e),
            };
            results.push((name, result));
        }
        results
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

enum Event {
    Command(Option<Command>),
    Exited(io::Result<ExitStatus>),
    RestartDue,
}

/// Drives one unit: serves commands, observes exits, applies restart decisions.
struct UnitWorker {
    runner: ProcessRunner,
    policy: Arc<dyn RestartPolicy>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<RunState>,
    restart_at: Option<Instant>,
}

impl UnitWorker {
    async fn run(mut self) {
        loop {
            let restart_at = self.restart_at;
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                status = self.runner.wait(), if self.runner.has_child() => Event::Exited(status),
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => Event::RestartDue,
            };

            match event {
                Event::Command(Some(command)) => self.handle(command).await,
                Event::Command(None) => {
                    let timeout = self.runner.spec().kill_timeout;
                    if let Err(e) = self.runner.stop(timeout).await {
                        error!(unit = %self.runner.spec().name, error = %e, "Failed to stop unit on shutdown");
                    }
                    self.publish();
                    break;
                }
                Event::Exited(status) => {
                    let exit = match status {
                        Ok(status) => ExitInfo::from(status),
                        Err(e) => {
                            warn!(unit = %self.runner.spec().name, error = %e, "Lost track of child exit status");
                            ExitInfo {
                                code: None,
                                signal: None,
                            }
                        }
                    };
                    self.on_exit(exit).await;
                    self.publish();
                }
                Event::RestartDue => {
                    self.restart_at = None;
                    if self.runner.phase() == Phase::Crashed {
                        // The unit rests in STOPPED with `last_error` set; the runner logs the cause.
                        if let Err(e) = self.runner.respawn().await {
                            warn!(unit = %self.runner.spec().name, error = %e, "Automatic restart failed");
                        }
                    }
                    self.publish();
                }
            }
        }
    }

    async fn on_exit(&mut self, exit: ExitInfo) {
        if self.runner.observe_exit(exit).await != Phase::Crashed {
            return;
        }

        let name = self.runner.spec().name.clone();
        let decision = self.policy.decide(self.runner.state());
        self.runner.prune_restarts(self.policy.window());
        let applied = match decision {
            RestartDecision::Restart { after } => {
                warn!(
                    unit = %name,
                    exit = %exit,
                    delay_ms = after.as_millis() as u64,
                    restarts = self.runner.state().restarts,
                    "Unit crashed, scheduling restart"
                );
                self.restart_at = Some(Instant::now() + after);
                Ok(())
            }
            RestartDecision::GiveUp => {
                error!(
                    unit = %name,
                    exit = %exit,
                    restarts = self.runner.state().restarts,
                    "Unit crashed, giving up"
                );
                self.runner.mark_failed()
            }
            RestartDecision::Settle => {
                info!(unit = %name, exit = %exit, "Unit finished");
                self.runner.settle()
            }
        };

        if let Err(e) = applied {
            error!(unit = %name, error = %e, "Failed to apply restart decision");
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let result = self.start().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop { timeout, reply } => {
                self.restart_at = None;
                let timeout = timeout.unwrap_or(self.runner.spec().kill_timeout);
                let result = self.runner.stop(timeout).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Restart { timeout, reply } => {
                let result = self.restart(timeout).await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self.runner.phase() {
            Phase::Running | Phase::Starting => return Ok(()),
            Phase::Crashed => {
                self.restart_at = None;
                self.runner.settle()?;
            }
            Phase::Failed => self.runner.reset()?,
            Phase::Stopped | Phase::Stopping => {}
        }
        self.runner.start().await
    }

    async fn restart(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.restart_at = None;
        let timeout = timeout.unwrap_or(self.runner.spec().kill_timeout);
        self.runner.stop(timeout).await?;
        self.runner.reset()?;
        self.runner.start().await
    }

    fn publish(&self) {
        self.state.send_replace(self.runner.state().clone());
    }
}
