//! Path utilities for canon
//!
//! Handles XDG Base Directory specification compliance for config,
//! state, and runtime directories.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "canon";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the default Unix socket path of the session backend
///
/// Location: `$XDG_RUNTIME_DIR/canon/canon.sock` or `/tmp/canon-$UID/canon.sock`
pub fn socket_path() -> PathBuf {
    runtime_dir().join("canon.sock")
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/canon` or `/tmp/canon-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/canon` or `~/.config/canon`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
}

/// Get the main configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory (session cache, reconnect alarm)
///
/// Location: `$XDG_STATE_HOME/canon` or `~/.local/state/canon`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_dir().join(".local").join("state").join(APP_NAME))
}

/// Get the persisted session cache file
pub fn session_cache_file() -> PathBuf {
    state_dir().join("sessions.json")
}

/// Get the persisted reconnect alarm file
pub fn alarm_file() -> PathBuf {
    state_dir().join("reconnect-alarm.json")
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/canon/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Ensure the parent directory of a file exists
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_socket_path_is_in_runtime_dir() {
        let sock = socket_path();
        assert!(sock.starts_with(runtime_dir()));
        assert_eq!(sock.file_name().unwrap().to_str().unwrap(), "canon.sock");
    }

    #[test]
    fn test_state_files_live_in_state_dir() {
        let state = state_dir();
        assert!(session_cache_file().starts_with(&state));
        assert!(alarm_file().starts_with(&state));
        assert!(log_dir().starts_with(&state));
    }

    #[test]
    fn test_config_file_name() {
        assert_eq!(config_file().file_name().unwrap(), "config.toml");
    }

    #[test]
    fn test_ensure_parent_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("sessions.json");

        ensure_parent(&file).unwrap();
        assert!(file.parent().unwrap().is_dir());
    }

    #[test]
    fn test_ensure_parent_of_bare_file_name() {
        ensure_parent(Path::new("sessions.json")).unwrap();
    }
}
