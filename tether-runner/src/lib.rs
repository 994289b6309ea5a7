pub mod policy;
pub mod process;
pub mod sink;
pub mod supervisor;

pub use policy::{
    policy_for, AlwaysRestart, ExponentialBackoff, FixedDelay, NoRestart, RestartDecision,
    RestartPolicy,
};
pub use process::{ProcessRunner, StopOutcome};
pub use sink::{LogSink, SinkHandle};
pub use supervisor::Supervisor;
