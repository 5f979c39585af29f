//! Session listing

use anyhow::Result;
use colored::Colorize;
use kojo_core::SessionStatus;
use kojo_sessions::SessionStore;

pub async fn run() -> Result<()> {
    let store = SessionStore::open_default()?;
    let sessions = store.load()?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    for session in sessions {
        let status = match session.status {
            SessionStatus::Running => "running".green(),
            SessionStatus::Exited => match session.exit_code {
                Some(0) | None => "exited".yellow(),
                Some(_) => "failed".red(),
            },
        };
        let exit = session
            .exit_code
            .map(|c| format!(" (exit {c})"))
            .unwrap_or_default();
        println!(
            "{}  {:<8} {}{}  {}  {}",
            session.id.bold(),
            session.tool,
            status,
            exit,
            session.created_at.format("%Y-%m-%d %H:%M"),
            session.work_dir.display()
        );
    }

    Ok(())
}
