pub mod loader;
pub mod validator;

pub use loader::{load_file, parse_ecosystem, ConfigFormat, RawApp};
pub use validator::Validator;
