//! Paths and environment lookup for the Kojo host process.

use crate::error::{KojoError, Result};
use std::path::PathBuf;

/// Terminal type forced into every child environment.
pub const TERM: &str = "xterm-256color";

/// Login shell used when `$SHELL` is unset.
pub const DEFAULT_SHELL: &str = "/bin/zsh";

/// Get the kojo configuration directory (`$KOJO_HOME` or `<config-dir>/kojo`)
pub fn kojo_home() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("KOJO_HOME") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let base = dirs::config_dir().ok_or(KojoError::MissingDirectory("config"))?;
    Ok(base.join("kojo"))
}

/// Get the sessions file path
pub fn sessions_path() -> Result<PathBuf> {
    Ok(kojo_home()?.join("sessions.json"))
}

/// Get the daemon PID file path
pub fn pid_path() -> Result<PathBuf> {
    Ok(kojo_home()?.join("daemon.pid"))
}

/// Get the daemon log file path
pub fn log_path() -> Result<PathBuf> {
    Ok(kojo_home()?.join("daemon.log"))
}

/// Directory holding the per-session raw output FIFOs.
pub fn pipe_dir() -> PathBuf {
    std::env::temp_dir().join("kojo")
}

/// The user's login shell (`$SHELL`, defaulting to zsh).
pub fn login_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_dir_is_under_temp() {
        assert!(pipe_dir().starts_with(std::env::temp_dir()));
        assert!(pipe_dir().ends_with("kojo"));
    }

    #[test]
    fn login_shell_has_default() {
        // Whatever the environment says, the result is never empty.
        assert!(!login_shell().is_empty());
    }
}
