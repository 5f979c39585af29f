//! Daemon process management

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::Command;

pub struct DaemonManager;

impl DaemonManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn is_running(&self) -> bool {
        if let Ok(pid_path) = kojo_core::settings::pid_path() {
            if let Ok(pid_str) = tokio::fs::read_to_string(&pid_path).await {
                if let Ok(pid) = pid_str.trim().parse::<u32>() {
                    return unsafe { libc::kill(pid as i32, 0) == 0 };
                }
            }
        }
        false
    }

    pub async fn start(&self) -> Result<()> {
        let kojo_home = kojo_core::settings::kojo_home()?;
        let pid_path = kojo_core::settings::pid_path()?;

        tokio::fs::create_dir_all(&kojo_home).await?;

        // Re-exec ourselves detached as the daemon process.
        let current_exe = std::env::current_exe()?;
        let mut cmd = Command::new(current_exe);
        cmd.arg("daemon")
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .current_dir(&kojo_home)
            .env("KOJO_DAEMON", "1");
        cmd.process_group(0);

        let child = cmd.spawn().context("Failed to spawn daemon process")?;

        let pid = child.id().context("Failed to get daemon PID")?;
        tokio::fs::write(&pid_path, pid.to_string()).await?;

        // Give the daemon a moment to come up.
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let pid_path = kojo_core::settings::pid_path()?;

        if let Ok(pid_str) = tokio::fs::read_to_string(&pid_path).await {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        let _ = tokio::fs::remove_file(&pid_path).await;

        Ok(())
    }
}
