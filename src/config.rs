//! Registry location and logging setup.

use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const APP_DIR: &str = "jr";
const DB_FILE: &str = "jr.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
}

impl Config {
    /// Resolve the effective configuration. An explicit `db` wins over the
    /// XDG default.
    pub fn resolve(db: Option<PathBuf>) -> Result<Self> {
        let db_path = match db {
            Some(path) => path,
            None => default_db_path(std::env::var_os("XDG_DATA_HOME"), dirs::home_dir())?,
        };
        Ok(Self { db_path })
    }
}

/// `$XDG_DATA_HOME/jr/jr.db`, else `~/.local/state/jr/jr.db`.
fn default_db_path(xdg_data_home: Option<OsString>, home: Option<PathBuf>) -> Result<PathBuf> {
    let base = match xdg_data_home.filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home
            .ok_or_else(|| anyhow!("cannot locate home directory for the job registry"))?
            .join(".local")
            .join("state"),
    };
    Ok(base.join(APP_DIR).join(DB_FILE))
}

/// Install the global tracing subscriber. Logs go to stderr.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("JR_LOG") {
        level
    } else {
        "warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_data_home_takes_precedence() {
        let path = default_db_path(Some("/data".into()), Some("/home/ana".into())).unwrap();
        assert_eq!(path, PathBuf::from("/data/jr/jr.db"));
    }

    #[test]
    fn empty_xdg_falls_back_to_local_state() {
        let path = default_db_path(Some(OsString::new()), Some("/home/ana".into())).unwrap();
        assert_eq!(path, PathBuf::from("/home/ana/.local/state/jr/jr.db"));
    }

    #[test]
    fn missing_home_is_an_error() {
        assert!(default_db_path(None, None).is_err());
    }

    #[test]
    fn explicit_db_wins() {
        let cfg = Config::resolve(Some("/tmp/x.db".into())).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
    }
}
