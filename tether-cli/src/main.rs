mod session;

use clap::{Parser, Subcommand};
use session::SessionState;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tether_config::{load_file, Validator};
use tether_core::{Phase, ProcessSpec, RunState, TetherError};
use tether_runner::{StopOutcome, Supervisor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_VALIDATION: i32 = 1;
const EXIT_UNSETTLED: i32 = 2;

const STATE_REFRESH: Duration = Duration::from_millis(500);
const SESSION_EXIT_SLACK: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether process supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ecosystem file declaring the apps (JSON, or TOML by extension)
    #[arg(short, long, global = true, default_value = "ecosystem.json")]
    config: PathBuf,

    /// Directory relative paths are resolved against (defaults to the config file's directory)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Directory for logs without an explicit path
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

/// The same grammar is accepted on stdin while a session is running
#[derive(Parser)]
#[command(name = "tether", no_binary_name = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Commands {
    /// Start a unit (or all) and supervise in the foreground
    Start {
        /// Unit name or "all"
        target: String,
    },

    /// Stop a unit (or all)
    Stop {
        /// Unit name or "all"
        target: String,

        /// Seconds to wait before killing (defaults to each unit's kill_timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show phase, pid, restart count and last exit
    Status {
        /// Unit name (all units when omitted)
        name: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Restart a unit and supervise in the foreground
    Restart {
        /// Unit name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let (specs, log_dir) =
        match load_specs(&cli.config, cli.base_dir.as_deref(), cli.log_dir.as_deref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                eprintln!("✗ {}", e);
                process::exit(EXIT_VALIDATION);
            }
        };
    let state_file = session::state_path(&log_dir);

    let supervisor = Arc::new(Supervisor::new());
    for spec in specs {
        supervisor.add(spec).await?;
    }

    let code = match cli.command {
        command @ (Commands::Start { .. } | Commands::Restart { .. }) => {
            if let Some(live) = SessionState::read_live(&state_file).await {
                eprintln!("✗ Units are already supervised by session pid {}", live.pid);
                process::exit(EXIT_UNSETTLED);
            }
            run_session(supervisor, command, &state_file).await?
        }
        command => execute_detached(&supervisor, command, &state_file).await?,
    };

    process::exit(code);
}

/// Load and validate the ecosystem file, returning the specs and the log directory.
fn load_specs(
    config: &Path,
    base_dir: Option<&Path>,
    log_dir: Option<&Path>,
) -> Result<(Vec<ProcessSpec>, PathBuf), TetherError> {
    let apps = load_file(config)?;

    let dir = match base_dir {
        Some(dir) => dir,
        None => config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(".")),
    };
    let base_dir = std::fs::canonicalize(dir).map_err(|e| {
        TetherError::Validation(format!("Cannot resolve {}: {}", dir.display(), e))
    })?;

    let mut validator = Validator::new(&base_dir)?;
    if let Some(dir) = log_dir {
        validator = validator.with_log_dir(dir);
    }
    let specs = validator.validate_batch(&apps)?;
    Ok((specs, validator.log_dir().to_path_buf()))
}

/// Run one command against the supervisor and map the result to an exit code.
async fn execute(supervisor: &Supervisor, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Start { target } => {
            let targets = match resolve_targets(supervisor, &target).await {
                Ok(targets) => targets,
                Err(e) => return Ok(report_error(&e)),
            };
            let mut code = EXIT_OK;
            for name in targets {
                match supervisor.start(&name).await {
                    Ok(()) => {
                        let pid = supervisor.status_of(&name).await.and_then(|s| s.pid);
                        println!("✓ {} started (pid {})", name, format_pid(pid));
                    }
                    Err(e) => {
                        eprintln!("✗ {}: {}", name, e);
                        code = EXIT_UNSETTLED;
                    }
                }
            }
            Ok(code)
        }
        Commands::Stop { target, timeout } => {
            let timeout = timeout.map(Duration::from_secs);
            let targets = match resolve_targets(supervisor, &target).await {
                Ok(targets) => targets,
                Err(e) => return Ok(report_error(&e)),
            };
            let mut code = EXIT_OK;
            for name in targets {
                let result = supervisor.stop(&name, timeout).await;
                if !report_stop(&name, &result) {
                    code = EXIT_UNSETTLED;
                }
            }
            Ok(code)
        }
        Commands::Status { name, json } => {
            let states = match name {
                Some(name) => match supervisor.status_of(&name).await {
                    Some(state) => vec![state],
                    None => return Ok(report_error(&TetherError::UnitNotFound(name))),
                },
                None => supervisor.status().await,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else {
                print!("{}", format_status_table(&states));
            }
            Ok(EXIT_OK)
        }
        Commands::Restart { name } => match supervisor.restart(&name, None).await {
            Ok(()) => {
                let pid = supervisor.status_of(&name).await.and_then(|s| s.pid);
                println!("✓ {} restarted (pid {})", name, format_pid(pid));
                Ok(EXIT_OK)
            }
            Err(e) => Ok(report_error(&e)),
        },
    }
}

/// `status` and `stop` outside a session act on the session that owns the units, if any.
async fn execute_detached(
    supervisor: &Supervisor,
    command: Commands,
    state_file: &Path,
) -> anyhow::Result<i32> {
    let live = SessionState::read_live(state_file).await;

    match (command, live) {
        (Commands::Status { name, json }, Some(session)) => {
            let states = match name {
                Some(name) => match session.unit(&name) {
                    Some(state) => vec![state.clone()],
                    None => return Ok(report_error(&TetherError::UnitNotFound(name))),
                },
                None => session.units.clone(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else {
                print!("{}", format_status_table(&states));
            }
            Ok(EXIT_OK)
        }
        (Commands::Status { name, json }, None) => {
            eprintln!("No running session; showing configured units");
            execute(supervisor, Commands::Status { name, json }).await
        }
        (Commands::Stop { target, timeout }, Some(session)) => {
            if target != "all" {
                if session.unit(&target).is_none() {
                    return Ok(report_error(&TetherError::UnitNotFound(target)));
                }
                eprintln!(
                    "✗ {} is supervised by session pid {}; use that session's console, or stop all",
                    target, session.pid
                );
                return Ok(EXIT_UNSETTLED);
            }
            let deadline = timeout.map(Duration::from_secs).unwrap_or_default() + SESSION_EXIT_SLACK;
            Ok(stop_session(&session, state_file, deadline).await)
        }
        (Commands::Stop { target, .. }, None) => {
            if let Err(e) = resolve_targets(supervisor, &target).await {
                return Ok(report_error(&e));
            }
            eprintln!("✗ No running session; nothing to stop");
            Ok(EXIT_UNSETTLED)
        }
        (command, _) => execute(supervisor, command).await,
    }
}

/// Signal a session to stop all its units, then wait for it to exit.
async fn stop_session(session: &SessionState, state_file: &Path, deadline: Duration) -> i32 {
    if let Err(e) = session.terminate() {
        eprintln!("✗ Cannot signal session pid {}: {}", session.pid, e);
        return EXIT_UNSETTLED;
    }

    let waited = tokio::time::timeout(deadline, async {
        while SessionState::read_live(state_file).await.is_some() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    match waited {
        Ok(()) => {
            println!("✓ Session pid {} stopped", session.pid);
            EXIT_OK
        }
        Err(_) => {
            eprintln!("✗ Session pid {} is still running", session.pid);
            EXIT_UNSETTLED
        }
    }
}

/// Supervise in the foreground until every unit settles or a signal arrives.
async fn run_session(
    supervisor: Arc<Supervisor>,
    command: Commands,
    state_file: &Path,
) -> anyhow::Result<i32> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut code = execute(&supervisor, command).await?;
    publish_state(&supervisor, state_file).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console = true;
    let mut refresh = tokio::time::interval(STATE_REFRESH);

    loop {
        tokio::select! {
            _ = refresh.tick() => publish_state(&supervisor, state_file).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping all units");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated, stopping all units");
                break;
            }
            _ = supervisor.wait_settled() => {
                info!("No units left to supervise");
                break;
            }
            line = lines.next_line(), if console => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle_console_line(&supervisor, &line).await {
                        warn!(error = %e, "Console command failed");
                    }
                }
                Ok(None) => console = false,
                Err(e) => {
                    warn!(error = %e, "Console input closed");
                    console = false;
                }
            },
        }
    }

    for (name, result) in supervisor.stop_all(None).await {
        if !matches!(result, Ok(StopOutcome::AlreadyStopped)) && !report_stop(&name, &result) {
            code = EXIT_UNSETTLED;
        }
    }

    let states = supervisor.status().await;
    let unsettled = unsettled_units(&states);
    for state in &unsettled {
        let reason = state.last_error.as_deref().unwrap_or_else(|| state.phase.as_str());
        eprintln!("✗ {}: {}", state.name, reason);
    }
    if !unsettled.is_empty() {
        code = EXIT_UNSETTLED;
    }

    session::remove(state_file).await;
    Ok(code)
}

async fn publish_state(supervisor: &Supervisor, state_file: &Path) {
    let state = SessionState::new(process::id(), supervisor.status().await);
    if let Err(e) = state.write(state_file).await {
        warn!(path = %state_file.display(), error = %e, "Failed to publish session state");
    }
}

/// Units that did not end where the operator left them: given up on, or
/// stopped by a start that failed.
fn unsettled_units(states: &[RunState]) -> Vec<&RunState> {
    states
        .iter()
        .filter(|state| match state.phase {
            Phase::Failed => true,
            Phase::Stopped => state.last_error.is_some(),
            _ => false,
        })
        .collect()
}

async fn handle_console_line(supervisor: &Supervisor, line: &str) -> anyhow::Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(());
    }

    match ConsoleLine::try_parse_from(words) {
        Ok(parsed) => {
            execute(supervisor, parsed.command).await?;
        }
        Err(e) => {
            eprintln!("{}", e);
        }
    }
    Ok(())
}

async fn resolve_targets(supervisor: &Supervisor, target: &str) -> Result<Vec<String>, TetherError> {
    let names = supervisor.names().await;
    if target == "all" {
        return Ok(names);
    }
    if names.iter().any(|name| name == target) {
        Ok(vec![target.to_string()])
    } else {
        Err(TetherError::UnitNotFound(target.to_string()))
    }
}

fn report_error(e: &TetherError) -> i32 {
    eprintln!("✗ {}", e);
    match e {
        TetherError::Validation(_) | TetherError::UnitNotFound(_) => EXIT_VALIDATION,
        _ => EXIT_UNSETTLED,
    }
}

/// Print a stop result; false when the unit missed its grace period or could not be stopped.
fn report_stop(name: &str, result: &Result<StopOutcome, TetherError>) -> bool {
    match result {
        Ok(StopOutcome::AlreadyStopped) => {
            println!("✓ {} already stopped", name);
            true
        }
        Ok(StopOutcome::Cancelled) => {
            println!("✓ {} stopped (pending restart cancelled)", name);
            true
        }
        Ok(StopOutcome::Graceful) => {
            println!("✓ {} stopped", name);
            true
        }
        Ok(StopOutcome::Escalated) => {
            eprintln!("✗ {} did not exit in time and was killed", name);
            false
        }
        Err(e) => {
            eprintln!("✗ {}: {}", name, e);
            false
        }
    }
}

fn format_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
}

fn format_status_table(states: &[RunState]) -> String {
    let width = states
        .iter()
        .map(|state| state.name.len())
        .max()
        .unwrap_or(0)
        .max(4);

    let mut out = format!(
        "{:<width$}  {:<8}  {:>7}  {:>8}  {}\n",
        "NAME",
        "PHASE",
        "PID",
        "RESTARTS",
        "LAST EXIT",
        width = width
    );
    for state in states {
        let last_exit = state
            .last_exit
            .map_or_else(|| "-".to_string(), |exit| exit.to_string());
        out.push_str(&format!(
            "{:<width$}  {:<8}  {:>7}  {:>8}  {}\n",
            state.name,
            state.phase,
            format_pid(state.pid),
            state.restarts,
            last_exit,
            width = width
        ));
    }
    out
}
