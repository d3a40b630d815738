//! XDG Base Directory paths for treefs state.
//!
//! | Purpose | XDG Variable | Default | treefs Path |
//! |---------|--------------|---------|-------------|
//! | Config | `$XDG_CONFIG_HOME` | `~/.config` | `$XDG_CONFIG_HOME/treefs/config.toml` |
//! | Repositories | `$XDG_DATA_HOME` | `~/.local/share` | `$XDG_DATA_HOME/treefs/repos/<fs-id>/` |

use std::path::PathBuf;

use directories::BaseDirs;

/// Get the data directory for persistent state.
///
/// Uses `$XDG_DATA_HOME/treefs` or falls back to `~/.local/share/treefs`.
pub fn data_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback().join(".local").join("share"))
        .join("treefs")
}

/// Get the config directory.
///
/// Uses `$XDG_CONFIG_HOME/treefs` or falls back to `~/.config/treefs`.
pub fn config_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback().join(".config"))
        .join("treefs")
}

/// Default config file location.
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Directory holding disk-backed object stores, one per filesystem id.
pub fn repos_dir() -> PathBuf {
    data_dir().join("repos")
}

fn home_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
