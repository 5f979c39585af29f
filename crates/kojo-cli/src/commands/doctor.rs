//! Environment diagnosis

use anyhow::Result;
use colored::Colorize;
use kojo_sessions::SessionManager;

pub async fn run() -> Result<()> {
    println!("{}", "Kojo environment".bold());

    match which::which("tmux") {
        Ok(path) => println!("  {} mux: {}", "ok".green(), path.display()),
        Err(_) => println!(
            "  {} mux: tmux not found on PATH (sessions cannot be hosted)",
            "!!".red()
        ),
    }

    for (name, status) in SessionManager::tool_availability() {
        match status.path {
            Some(path) => println!("  {} {}: {}", "ok".green(), name, path.display()),
            None => println!("  {} {}: not installed", "--".yellow(), name),
        }
    }

    println!("  sessions file: {}", kojo_core::settings::sessions_path()?.display());
    println!("  pipe dir: {}", kojo_core::settings::pipe_dir().display());
    println!("  login shell: {}", kojo_core::settings::login_shell());

    Ok(())
}
