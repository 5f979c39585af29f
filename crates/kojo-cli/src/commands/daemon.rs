//! Daemon management commands

use anyhow::{Context, Result};
use colored::Colorize;
use kojo_sessions::{SessionManager, SessionStore};

pub async fn start() -> Result<()> {
    println!("{}", "Starting kojo daemon...".blue());

    let daemon_manager = crate::daemon::DaemonManager::new();

    if daemon_manager.is_running().await {
        println!("{}", "Daemon is already running".green());
        return Ok(());
    }

    daemon_manager
        .start()
        .await
        .context("Failed to start daemon")?;

    println!("{}", "Daemon started".green());
    Ok(())
}

pub async fn stop() -> Result<()> {
    println!("{}", "Stopping kojo daemon...".blue());

    let daemon_manager = crate::daemon::DaemonManager::new();

    if !daemon_manager.is_running().await {
        println!("{}", "Daemon is not running".yellow());
        return Ok(());
    }

    daemon_manager
        .stop()
        .await
        .context("Failed to stop daemon")?;

    println!("{}", "Daemon stopped".green());
    Ok(())
}

pub async fn restart() -> Result<()> {
    let daemon_manager = crate::daemon::DaemonManager::new();

    if daemon_manager.is_running().await {
        daemon_manager.stop().await?;
    }

    daemon_manager
        .start()
        .await
        .context("Failed to restart daemon")?;

    println!("{}", "Daemon restarted".green());
    Ok(())
}

pub async fn status() -> Result<()> {
    let daemon_manager = crate::daemon::DaemonManager::new();

    if daemon_manager.is_running().await {
        println!("{}", "Daemon is running".green());

        // Known sessions, from the shared store.
        if let Ok(store) = SessionStore::open_default() {
            if let Ok(sessions) = store.load() {
                let running = sessions
                    .iter()
                    .filter(|s| s.status == kojo_core::SessionStatus::Running)
                    .count();
                println!("   Sessions: {} known, {} running", sessions.len(), running);
            }
        }
    } else {
        println!("{}", "Daemon is not running".yellow());
    }

    Ok(())
}

pub async fn logs(follow: bool) -> Result<()> {
    let log_path = kojo_core::settings::log_path()?;

    if !log_path.exists() {
        println!("{}", "No log file found".yellow());
        return Ok(());
    }

    if follow {
        println!("{}", "Following daemon logs (Ctrl+C to exit)...".blue());

        let mut cmd = tokio::process::Command::new("tail")
            .arg("-f")
            .arg(&log_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .spawn()?;

        cmd.wait().await?;
    } else {
        let content = tokio::fs::read_to_string(&log_path).await?;
        println!("{}", content);
    }

    Ok(())
}

/// The daemon process itself: recover persisted sessions, then host the
/// manager until asked to stop. Shutdown detaches mux-backed sessions so
/// they survive until the next run.
pub async fn run() -> Result<()> {
    let kojo_home = kojo_core::settings::kojo_home()?;
    tokio::fs::create_dir_all(&kojo_home).await?;

    let file_appender = tracing_appender::rolling::never(&kojo_home, "daemon.log");
    let (writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("KOJO_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kojo daemon starting");

    let store = SessionStore::open_default()?;
    let manager = SessionManager::new(store);

    manager.set_on_exit(Box::new(|session| {
        let info = session.info();
        tracing::info!(
            session = %info.id,
            tool = %info.tool,
            exit_code = ?info.exit_code,
            "session ended"
        );
    }));

    manager.startup().await?;

    wait_for_shutdown().await;

    tracing::info!("kojo daemon shutting down");
    manager.stop_all().await;

    if let Ok(pid_path) = kojo_core::settings::pid_path() {
        let _ = tokio::fs::remove_file(&pid_path).await;
    }
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("install signal handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
