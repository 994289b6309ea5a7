//! Restart policies.
//!
//! A policy is a pure function of a unit's [`RunState`]: the restart window is
//! measured back from the recorded exit time, so the same history always yields
//! the same decision.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{RestartSettings, RestartStrategy, RunState};

/// What to do after an unrequested exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { after: Duration },
    /// Too many restarts, or restarting is disabled: the unit fails.
    GiveUp,
    /// The exit was expected: the unit rests in `STOPPED`.
    Settle,
}

pub trait RestartPolicy: Send + Sync + fmt::Debug {
    fn decide(&self, state: &RunState) -> RestartDecision;

    /// How far back restarts count against the cap; `None` when they never do.
    fn window(&self) -> Option<Duration> {
        None
    }
}

/// Build the policy described by a unit's restart settings
pub fn policy_for(settings: &RestartSettings) -> Arc<dyn RestartPolicy> {
    match settings.strategy {
        RestartStrategy::Never => Arc::new(NoRestart),
        RestartStrategy::Fixed { delay } => Arc::new(FixedDelay {
            delay,
            max_restarts: settings.max_restarts,
            window: settings.window,
            stop_exit_codes: settings.stop_exit_codes.clone(),
        }),
        RestartStrategy::Exponential { initial, max_delay } => Arc::new(ExponentialBackoff {
            initial,
            max_delay,
            max_restarts: settings.max_restarts,
            window: settings.window,
            min_uptime: settings.min_uptime,
            stop_exit_codes: settings.stop_exit_codes.clone(),
        }),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRestart;

impl RestartPolicy for NoRestart {
    fn decide(&self, state: &RunState) -> RestartDecision {
        if state.last_exit.map_or(false, |exit| exit.success()) {
            RestartDecision::Settle
        } else {
            RestartDecision::GiveUp
        }
    }
}

/// Restart after every exit, forever
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRestart {
    pub delay: Duration,
}

impl RestartPolicy for AlwaysRestart {
    fn decide(&self, _state: &RunState) -> RestartDecision {
        RestartDecision::Restart { after: self.delay }
    }
}

#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_restarts: u32,
    pub window: Duration,
    pub stop_exit_codes: Vec<i32>,
}

impl RestartPolicy for FixedDelay {
    fn decide(&self, state: &RunState) -> RestartDecision {
        if expected_exit(state, &self.stop_exit_codes) {
            return RestartDecision::Settle;
        }
        if window_exhausted(state, self.max_restarts, self.window) {
            return RestartDecision::GiveUp;
        }
        RestartDecision::Restart { after: self.delay }
    }

    fn window(&self) -> Option<Duration> {
        Some(self.window)
    }
}

/// Doubling delay for runs that die before `min_uptime`, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_restarts: u32,
    pub window: Duration,
    pub min_uptime: Duration,
    pub stop_exit_codes: Vec<i32>,
}

impl ExponentialBackoff {
    fn backoff(&self, unstable_runs: usize) -> Duration {
        let exponent = unstable_runs.saturating_sub(1).min(31) as u32;
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        let settings = RestartSettings::default();
        let (initial, max_delay) = match settings.strategy {
            RestartStrategy::Exponential { initial, max_delay } => (initial, max_delay),
            _ => (Duration::from_millis(100), Duration::from_secs(15)),
        };
        Self {
            initial,
            max_delay,
            max_restarts: settings.max_restarts,
            window: settings.window,
            min_uptime: settings.min_uptime,
            stop_exit_codes: settings.stop_exit_codes,
        }
    }
}

impl RestartPolicy for ExponentialBackoff {
    fn decide(&self, state: &RunState) -> RestartDecision {
        if expected_exit(state, &self.stop_exit_codes) {
            return RestartDecision::Settle;
        }
        if window_exhausted(state, self.max_restarts, self.window) {
            return RestartDecision::GiveUp;
        }

        let unstable_runs = state
            .runs
            .iter()
            .rev()
            .take_while(|run| run.uptime() < self.min_uptime)
            .count();

        RestartDecision::Restart {
            after: self.backoff(unstable_runs),
        }
    }

    fn window(&self) -> Option<Duration> {
        Some(self.window)
    }
}

fn expected_exit(state: &RunState, stop_exit_codes: &[i32]) -> bool {
    state
        .last_exit
        .and_then(|exit| exit.code)
        .map_or(false, |code| stop_exit_codes.contains(&code))
}

/// True once `max_restarts` restarts happened within `window` of the last exit.
fn window_exhausted(state: &RunState, max_restarts: u32, window: Duration) -> bool {
    let recent = match state.last_exited_at {
        Some(exited_at) => chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| exited_at.checked_sub_signed(window))
            .map_or(state.recent_restarts.len(), |since| state.restarts_since(since)),
        None => state.recent_restarts.len(),
    };
    recent >= max_restarts as usize
}
