pub mod error;
pub mod models;

pub use error::{Result, TetherError};
pub use models::*;
