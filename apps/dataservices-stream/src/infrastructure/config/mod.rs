//! Configuration Module
//!
//! Environment-driven configuration for the stream client and its worker.

mod settings;

pub use settings::{
    ConfigError, Credentials, DEFAULT_REPORT_INTERVAL, ENV_PREFIX, StreamConfig, env_key,
};
pub(crate) use settings::{lookup_or, lookup_required, parse_bool, parse_opt, parse_secs};

/// Load `.env` from the current directory or the nearest ancestor holding one.
///
/// Returns the path that was loaded, if any.
pub fn load_dotenv() -> Option<std::path::PathBuf> {
    if let Ok(path) = dotenvy::dotenv() {
        return Some(path);
    }

    let cwd = std::env::current_dir().ok()?;
    let mut dir = cwd.as_path();
    while let Some(parent) = dir.parent() {
        let env_path = parent.join(".env");
        if env_path.exists() {
            return dotenvy::from_path(&env_path).ok().map(|()| env_path);
        }
        dir = parent;
    }
    None
}
