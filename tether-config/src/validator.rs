use crate::loader::RawApp;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tether_core::{
    ProcessSpec, RestartSettings, RestartStrategy, Result, TetherError, RESTART_LOG_LIMIT,
};

const DEFAULT_KILL_TIMEOUT_MS: u64 = 1600;
const DEFAULT_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Turns raw `apps` entries into validated [`ProcessSpec`]s.
///
/// Relative paths are resolved against `base_dir`; logs without an explicit
/// path land in `log_dir` as `<name>-out.log` and `<name>-error.log`.
#[derive(Debug, Clone)]
pub struct Validator {
    base_dir: PathBuf,
    log_dir: PathBuf,
}

impl Validator {
    /// A relative `base_dir` is anchored at the current directory.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        let base_dir = if base_dir.is_absolute() {
            normalize(base_dir)
        } else {
            let cwd = std::env::current_dir().map_err(|e| {
                TetherError::Validation(format!(
                    "Cannot resolve base directory {}: {}",
                    base_dir.display(),
                    e
                ))
            })?;
            normalize(&cwd.join(base_dir))
        };
        let log_dir = base_dir.join("logs");
        Ok(Self { base_dir, log_dir })
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = self.resolve(dir.as_ref());
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Validate a whole batch, rejecting duplicate names.
    pub fn validate_batch(&self, raws: &[RawApp]) -> Result<Vec<ProcessSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(raws.len());

        for raw in raws {
            let spec = self.validate(raw)?;
            if !seen.insert(spec.name.clone()) {
                return Err(TetherError::Validation(format!(
                    "Duplicate app name: {}",
                    spec.name
                )));
            }
            specs.push(spec);
        }

        Ok(specs)
    }

    /// Validate a single raw entry
    pub fn validate(&self, raw: &RawApp) -> Result<ProcessSpec> {
        let name = validate_name(raw.name.as_deref())?;
        let fail = |msg: String| TetherError::Validation(format!("{}: {}", name, msg));

        let cwd = match raw.cwd.as_deref() {
            Some(dir) => self.resolve(Path::new(dir)),
            None => self.base_dir.clone(),
        };
        if !cwd.is_dir() {
            return Err(fail(format!("cwd {} is not a directory", cwd.display())));
        }

        let script = raw.script.as_deref().map(str::trim).unwrap_or_default();
        if script.is_empty() {
            return Err(fail("script is required".to_string()));
        }
        let script = self.resolve_script(script).map_err(fail)?;

        let interpreter = match raw.interpreter.as_deref().map(str::trim) {
            None | Some("") | Some("none") => None,
            Some(interpreter) => Some(self.resolve_program(interpreter).map_err(fail)?),
        };

        if interpreter.is_none() && !is_executable(&script) {
            return Err(fail(format!(
                "script {} is not executable and no interpreter is set",
                script.display()
            )));
        }

        let restart = restart_settings(raw);
        if restart.max_restarts as usize > RESTART_LOG_LIMIT {
            return Err(fail(format!(
                "max_restarts {} exceeds the limit of {}",
                restart.max_restarts, RESTART_LOG_LIMIT
            )));
        }

        let env = validate_env(raw.env.as_ref()).map_err(fail)?;

        let out_log = match raw.output.as_deref() {
            Some(path) if !path.trim().is_empty() => self.resolve(Path::new(path)),
            _ => self.log_dir.join(format!("{}-out.log", name)),
        };
        let err_log = match raw.error.as_deref() {
            Some(path) if !path.trim().is_empty() => self.resolve(Path::new(path)),
            _ => self.log_dir.join(format!("{}-error.log", name)),
        };

        Ok(ProcessSpec {
            interpreter_args: raw
                .interpreter_args
                .clone()
                .map(|a| a.into_vec())
                .unwrap_or_default(),
            args: raw.args.clone().map(|a| a.into_vec()).unwrap_or_default(),
            truncate_logs: raw.truncate_logs.unwrap_or(false),
            kill_timeout: Duration::from_millis(raw.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS)),
            restart,
            name,
            script,
            interpreter,
            env,
            cwd,
            out_log,
            err_log,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.base_dir.join(path))
        }
    }

    fn resolve_script(&self, script: &str) -> std::result::Result<PathBuf, String> {
        let candidate = self.resolve(Path::new(script));
        if candidate.is_file() {
            return std::fs::File::open(&candidate)
                .map(|_| candidate.clone())
                .map_err(|e| format!("script {} is unreadable: {}", candidate.display(), e));
        }
        if is_bare_name(script) {
            if let Ok(found) = which::which(script) {
                return Ok(found);
            }
        }
        Err(format!("script {} not found", candidate.display()))
    }

    fn resolve_program(&self, program: &str) -> std::result::Result<PathBuf, String> {
        if is_bare_name(program) {
            return which::which(program)
                .map_err(|e| format!("interpreter {} not found on PATH: {}", program, e));
        }
        let candidate = self.resolve(Path::new(program));
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(format!("interpreter {} not found", candidate.display()))
        }
    }
}

fn validate_name(name: Option<&str>) -> Result<String> {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(TetherError::Validation("App name is required".to_string()));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(TetherError::Validation(format!(
            "App name {:?} contains path separators or control characters",
            name
        )));
    }
    Ok(name.to_string())
}

fn validate_env(
    env: Option<&BTreeMap<String, serde_json::Value>>,
) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    let Some(env) = env else {
        return Ok(out);
    };

    for (key, value) in env {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(format!("invalid environment variable name {:?}", key));
        }
        match value {
            serde_json::Value::String(s) if !s.contains('\0') => {
                out.insert(key.clone(), s.clone());
            }
            other => {
                return Err(format!(
                    "environment variable {} must be a string, got {}",
                    key, other
                ));
            }
        }
    }

    Ok(out)
}

fn restart_settings(raw: &RawApp) -> RestartSettings {
    let defaults = RestartSettings::default();

    let strategy = if raw.autorestart == Some(false) {
        RestartStrategy::Never
    } else if let Some(delay) = raw.restart_delay {
        RestartStrategy::Fixed {
            delay: Duration::from_millis(delay),
        }
    } else {
        let initial = Duration::from_millis(raw.exp_backoff_restart_delay.unwrap_or(DEFAULT_BACKOFF_MS));
        RestartStrategy::Exponential {
            initial,
            max_delay: MAX_BACKOFF.max(initial),
        }
    };

    RestartSettings {
        strategy,
        max_restarts: raw.max_restarts.unwrap_or(defaults.max_restarts),
        window: raw
            .restart_window
            .map(Duration::from_millis)
            .unwrap_or(defaults.window),
        min_uptime: raw
            .min_uptime
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_uptime),
        stop_exit_codes: raw.stop_exit_codes.clone().unwrap_or_default(),
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn is_bare_name(s: &str) -> bool {
    !s.contains(std::path::MAIN_SEPARATOR) && !s.contains('/')
}

/// Lexically clean a path: drop `.` and fold `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ArgList;
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(path: &Path, mode: u32) {
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn setup() -> (TempDir, Validator) {
        let dir = TempDir::new().unwrap();
        write_script(&dir.path().join("worker.sh"), 0o755);
        let validator = Validator::new(dir.path()).unwrap();
        (dir, validator)
    }

    fn raw(name: &str, script: &str) -> RawApp {
        RawApp {
            name: Some(name.to_string()),
            script: Some(script.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_minimal_record() {
        let (dir, validator) = setup();
        let spec = validator.validate(&raw("w", "worker.sh")).unwrap();

        assert_eq!(spec.name, "w");
        assert_eq!(spec.script, dir.path().join("worker.sh"));
        assert_eq!(spec.interpreter, None);
        assert_eq!(spec.cwd, dir.path());
        assert_eq!(spec.out_log, dir.path().join("logs/w-out.log"));
        assert_eq!(spec.err_log, dir.path().join("logs/w-error.log"));
        assert_eq!(spec.kill_timeout, Duration::from_millis(1600));
        assert_eq!(spec.restart, RestartSettings::default());
        assert!(!spec.truncate_logs);
    }

    #[test]
    fn test_relative_base_dir_yields_absolute_paths() {
        let dir = TempDir::new_in(".").unwrap();
        assert!(dir.path().is_relative());
        write_script(&dir.path().join("worker.sh"), 0o755);

        let validator = Validator::new(dir.path()).unwrap();
        assert!(validator.base_dir().is_absolute());

        let record = RawApp {
            output: Some("out/w.log".to_string()),
            ..raw("w", "worker.sh")
        };
        let spec = validator.validate(&record).unwrap();
        let base = std::env::current_dir().unwrap().join(dir.path().file_name().unwrap());
        assert_eq!(spec.script, base.join("worker.sh"));
        assert_eq!(spec.cwd, base);
        assert_eq!(spec.out_log, base.join("out/w.log"));
        assert_eq!(spec.err_log, base.join("logs/w-error.log"));
        for path in [&spec.script, &spec.cwd, &spec.out_log, &spec.err_log] {
            assert!(path.is_absolute(), "{} is relative", path.display());
        }
    }

    #[test]
    fn test_validate_requires_exec_bit_without_interpreter() {
        let (dir, validator) = setup();
        write_script(&dir.path().join("plain.sh"), 0o644);

        let err = validator.validate(&raw("w", "plain.sh")).unwrap_err();
        assert!(err.to_string().contains("not executable"));

        let record = RawApp {
            interpreter: Some("sh".to_string()),
            ..raw("w", "plain.sh")
        };
        assert!(validator.validate(&record).is_ok());
    }

    #[test]
    fn test_validate_rejects_untrackable_restart_cap() {
        let (_dir, validator) = setup();
        let record = RawApp {
            max_restarts: Some(RESTART_LOG_LIMIT as u32 + 1),
            ..raw("w", "worker.sh")
        };
        assert!(validator.validate(&record).unwrap_err().is_validation());

        let record = RawApp {
            max_restarts: Some(100),
            ..raw("w", "worker.sh")
        };
        assert_eq!(validator.validate(&record).unwrap().restart.max_restarts, 100);
    }

    #[test]
    fn test_validate_resolves_relative_log_paths() {
        let (dir, validator) = setup();
        let record = RawApp {
            output: Some("./logs/../out/./w.log".to_string()),
            error: Some("/var/log/w_err.log".to_string()),
            ..raw("w", "worker.sh")
        };
        let spec = validator.validate(&record).unwrap();
        assert_eq!(spec.out_log, dir.path().join("out/w.log"));
        assert_eq!(spec.err_log, PathBuf::from("/var/log/w_err.log"));
    }

    #[test]
    fn test_validate_custom_log_dir() {
        let (dir, validator) = setup();
        let validator = validator.with_log_dir("var");
        let spec = validator.validate(&raw("w", "worker.sh")).unwrap();
        assert_eq!(spec.out_log, dir.path().join("var/w-out.log"));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let (_dir, validator) = setup();
        assert!(validator.validate(&raw("", "worker.sh")).unwrap_err().is_validation());
        assert!(validator.validate(&raw("   ", "worker.sh")).is_err());
        assert!(validator
            .validate(&RawApp {
                name: None,
                ..raw("", "worker.sh")
            })
            .is_err());
        assert!(validator.validate(&raw("a/b", "worker.sh")).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_script() {
        let (_dir, validator) = setup();
        assert!(validator.validate(&raw("w", "")).is_err());
        assert!(validator.validate(&raw("w", "missing.sh")).is_err());
        assert!(validator.validate(&raw("w", "./nested/missing.sh")).is_err());
    }

    #[test]
    fn test_validate_resolves_bare_script_on_path() {
        let (_dir, validator) = setup();
        let spec = validator.validate(&raw("w", "sh")).unwrap();
        assert!(spec.script.is_absolute());
        assert!(spec.script.ends_with("sh"));
    }

    #[test]
    fn test_validate_interpreter() {
        let (_dir, validator) = setup();
        let record = RawApp {
            interpreter: Some("sh".to_string()),
            interpreter_args: Some(ArgList::Line("-e".to_string())),
            ..raw("w", "worker.sh")
        };
        let spec = validator.validate(&record).unwrap();
        assert!(spec.interpreter.unwrap().is_absolute());
        assert_eq!(spec.interpreter_args, vec!["-e"]);

        let record = RawApp {
            interpreter: Some("definitely-not-an-interpreter-xyz".to_string()),
            ..raw("w", "worker.sh")
        };
        assert!(validator.validate(&record).is_err());

        let record = RawApp {
            interpreter: Some("none".to_string()),
            ..raw("w", "worker.sh")
        };
        assert_eq!(validator.validate(&record).unwrap().interpreter, None);
    }

    #[test]
    fn test_validate_env_entries() {
        let (_dir, validator) = setup();
        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), json!("production"));
        let record = RawApp {
            env: Some(env.clone()),
            ..raw("w", "worker.sh")
        };
        let spec = validator.validate(&record).unwrap();
        assert_eq!(spec.env.get("NODE_ENV").map(String::as_str), Some("production"));

        env.insert("PORT".to_string(), json!(8080));
        let record = RawApp {
            env: Some(env),
            ..raw("w", "worker.sh")
        };
        assert!(validator.validate(&record).unwrap_err().is_validation());

        let mut bad_key = BTreeMap::new();
        bad_key.insert("A=B".to_string(), json!("x"));
        let record = RawApp {
            env: Some(bad_key),
            ..raw("w", "worker.sh")
        };
        assert!(validator.validate(&record).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_cwd() {
        let (_dir, validator) = setup();
        let record = RawApp {
            cwd: Some("does/not/exist".to_string()),
            ..raw("w", "worker.sh")
        };
        assert!(validator.validate(&record).is_err());
    }

    #[test]
    fn test_validate_batch_rejects_duplicates() {
        let (_dir, validator) = setup();
        let specs = validator
            .validate_batch(&[raw("a", "worker.sh"), raw("b", "worker.sh")])
            .unwrap();
        assert_eq!(specs.len(), 2);

        let err = validator
            .validate_batch(&[raw("a", "worker.sh"), raw("a", "worker.sh")])
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate app name: a"));
    }

    #[test]
    fn test_restart_settings_from_record() {
        let never = restart_settings(&RawApp {
            autorestart: Some(false),
            ..Default::default()
        });
        assert_eq!(never.strategy, RestartStrategy::Never);

        let fixed = restart_settings(&RawApp {
            restart_delay: Some(250),
            max_restarts: Some(3),
            restart_window: Some(10_000),
            stop_exit_codes: Some(vec![0]),
            ..Default::default()
        });
        assert_eq!(
            fixed.strategy,
            RestartStrategy::Fixed {
                delay: Duration::from_millis(250)
            }
        );
        assert_eq!(fixed.max_restarts, 3);
        assert_eq!(fixed.window, Duration::from_secs(10));
        assert_eq!(fixed.stop_exit_codes, vec![0]);

        let slow = restart_settings(&RawApp {
            exp_backoff_restart_delay: Some(30_000),
            ..Default::default()
        });
        assert_eq!(
            slow.strategy,
            RestartStrategy::Exponential {
                initial: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
