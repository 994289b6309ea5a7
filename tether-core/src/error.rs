use crate::models::Phase;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Unit {name} crashed: {detail}")]
    RuntimeCrash { name: String, detail: String },

    #[error("Unit {name} could not be terminated after {attempts} forced attempts")]
    TimeoutEscalated { name: String, attempts: u32 },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Configuration problems are reported to the operator with a distinct exit code.
    pub fn is_validation(&self) -> bool {
        matches!(self, TetherError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
