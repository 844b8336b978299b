//! Centralized path resolution for murmur
//!
//! Follows XDG Base Directory Specification with 12-factor env var overrides.
//!
//! ## Directory Layout
//!
//! ```text
//! ~/.local/share/murmur/     (XDG_DATA_HOME)
//! └── murmur.db
//!
//! ~/.config/murmur/          (XDG_CONFIG_HOME)
//! └── murmur.toml
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MURMUR_DB` | Database path | `~/.local/share/murmur/murmur.db` |
//! | `MURMUR_CONFIG` | Config file | `~/.config/murmur/murmur.toml` |

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DB_ENV: &str = "MURMUR_DB";
pub const CONFIG_ENV: &str = "MURMUR_CONFIG";

/// Get the XDG data directory for murmur
///
/// Priority: `XDG_DATA_HOME` > `~/.local/share`
pub fn data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("murmur");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/murmur");
    }

    PathBuf::from(".")
}

/// Get the XDG config directory for murmur
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("murmur");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/murmur");
    }

    PathBuf::from(".")
}

/// Get the database path
///
/// Priority: `MURMUR_DB` env var > `data_dir()/murmur.db`
pub fn db_path() -> PathBuf {
    std::env::var(DB_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("murmur.db"))
}

/// Get the config file path
///
/// Priority: `MURMUR_CONFIG` env var > `config_dir()/murmur.toml`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("murmur.toml"))
}

/// Create the directory that will hold the database file
pub fn ensure_db_dir(db_path: &Path) -> Result<()> {
    let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    if !dir.exists() {
        debug!("creating data directory: {}", dir.display());
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory: {}", dir.display()))?;
    }
    Ok(())
}

/// Log resolved paths for discoverability
pub fn log_paths() {
    use tracing::info;
    info!("data directory: {}", data_dir().display());
    info!("config file: {}", config_path().display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify env vars
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_path_env_vars() {
        env::remove_var(DB_ENV);
        env::remove_var(CONFIG_ENV);
        env::remove_var("XDG_DATA_HOME");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_env_var_override_db() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var(DB_ENV, "/custom/path/test.db");
        assert_eq!(db_path(), PathBuf::from("/custom/path/test.db"));
        clear_path_env_vars();
    }

    #[test]
    fn test_env_var_override_config() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var(CONFIG_ENV, "/custom/murmur.toml");
        assert_eq!(config_path(), PathBuf::from("/custom/murmur.toml"));
        clear_path_env_vars();
    }

    #[test]
    fn test_xdg_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("XDG_DATA_HOME", "/xdg/data");
        env::set_var("XDG_CONFIG_HOME", "/xdg/config");
        assert_eq!(db_path(), PathBuf::from("/xdg/data/murmur/murmur.db"));
        assert_eq!(config_path(), PathBuf::from("/xdg/config/murmur/murmur.toml"));
        clear_path_env_vars();
    }

    #[test]
    fn test_ensure_db_dir_creates_parent() -> Result<()> {
        let root = env::temp_dir().join(format!("murmur-paths-{}", uuid::Uuid::new_v4()));
        let db = root.join("nested").join("murmur.db");
        ensure_db_dir(&db)?;
        assert!(root.join("nested").is_dir());
        ensure_db_dir(Path::new("bare.db"))?;
        std::fs::remove_dir_all(&root)?;
        Ok(())
    }
}
