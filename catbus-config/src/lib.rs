// Configuration loading for catbus services
//
// Settings structs live next to the code that consumes them; this crate only
// knows how to find raw values in the process environment or a `.env` file.

pub mod env;
pub mod error;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};

use std::path::PathBuf;

/// Load a `.env` file from the current directory or its parents.
///
/// A missing file is not an error; the path of the loaded file is returned
/// when one was found.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Load a specific `.env` file, failing when it cannot be read.
pub fn load_dotenv_from(path: &str) -> Result<()> {
    dotenvy::from_path(path).map_err(|e| ConfigError::DotenvError(e.to_string()))
}
