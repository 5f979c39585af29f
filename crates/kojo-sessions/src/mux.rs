//! Thin synchronous wrapper around the mux (tmux) command line.
//!
//! Sessions the manager owns are named `kojo_<id>` so they can be told
//! apart from anything else running on the user's mux server. All commands
//! here are argv vectors; the only shell strings are the pane command and
//! the pipe-pane writer, whose interpolated values are single-quoted.

use kojo_core::{ids::shell_quote, settings, KojoError, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

/// Prefix of every mux session the manager owns.
pub const SESSION_PREFIX: &str = "kojo_";

const MUX_BIN: &str = "tmux";

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// An attach (or direct) process running under its own PTY.
pub struct AttachHandle {
    pub master: Box<dyn MasterPty + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// The raw-output FIFO fed by the mux's pipe-pane facility.
pub struct RawPipe {
    pub rx: pipe::Receiver,
    pub path: PathBuf,
}

/// Mux actions clients may trigger against a session. A closed set: each
/// action maps to a fixed subcommand, never to interpolated shell text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxAction {
    KillPane,
    NewWindow,
    PrevWindow,
    NextWindow,
    SplitHorizontal,
    SplitVertical,
    SelectPane,
    ResizePaneZoom,
    ChooseTree,
    CopyMode,
}

impl MuxAction {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "kill-pane" => Ok(MuxAction::KillPane),
            "new-window" => Ok(MuxAction::NewWindow),
            "prev-window" => Ok(MuxAction::PrevWindow),
            "next-window" => Ok(MuxAction::NextWindow),
            "split-h" => Ok(MuxAction::SplitHorizontal),
            "split-v" => Ok(MuxAction::SplitVertical),
            "select-pane" => Ok(MuxAction::SelectPane),
            "resize-pane-z" => Ok(MuxAction::ResizePaneZoom),
            "choose-tree" => Ok(MuxAction::ChooseTree),
            "copy-mode" => Ok(MuxAction::CopyMode),
            other => Err(KojoError::UnknownAction(other.to_string())),
        }
    }

    fn argv(self, target: &str) -> Vec<String> {
        let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            MuxAction::KillPane => owned(&["kill-pane", "-t", target]),
            MuxAction::NewWindow => owned(&["new-window", "-t", target]),
            MuxAction::PrevWindow => owned(&["previous-window", "-t", target]),
            MuxAction::NextWindow => owned(&["next-window", "-t", target]),
            MuxAction::SplitHorizontal => owned(&["split-window", "-h", "-t", target]),
            MuxAction::SplitVertical => owned(&["split-window", "-v", "-t", target]),
            MuxAction::SelectPane => owned(&["select-pane", "-t", target]),
            MuxAction::ResizePaneZoom => owned(&["resize-pane", "-Z", "-t", target]),
            MuxAction::ChooseTree => owned(&["choose-tree", "-t", target]),
            MuxAction::CopyMode => owned(&["copy-mode", "-t", target]),
        }
    }
}

/// Procedural wrapper over the mux CLI. Stateless; every operation shells
/// out synchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxAdapter;

impl MuxAdapter {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(MUX_BIN)
            .args(args)
            .output()
            .map_err(|e| KojoError::Mux(format!("{MUX_BIN} {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            return Err(KojoError::Mux(format!(
                "{MUX_BIN} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Mux session name backing the given session id.
    pub fn session_name(&self, id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    /// Keep attach clients out of the alternate screen so scrollback is not
    /// lost and wheel events reach the pane. Appends the terminal override
    /// only if it is not already set.
    pub fn ensure_server_config(&self) -> Result<()> {
        // The option can only be set once a server exists.
        let _ = self.run(&["start-server"]);
        let current = self
            .run(&["show-options", "-g", "terminal-overrides"])
            .unwrap_or_default();
        if !current.contains("smcup@") {
            self.run(&[
                "set-option",
                "-ga",
                "terminal-overrides",
                ",xterm*:smcup@:rmcup@",
            ])?;
        }
        Ok(())
    }

    /// Create a detached session running `shell_cmd`. The pane stays around
    /// after the command exits so its status can still be read.
    pub fn new_session(
        &self,
        name: &str,
        work_dir: &Path,
        shell_cmd: &str,
        disable_prefix: bool,
    ) -> Result<()> {
        self.run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            &work_dir.to_string_lossy(),
            shell_cmd,
        ])?;
        self.run(&["set-option", "-t", name, "remain-on-exit", "on"])?;
        self.run(&["set-option", "-t", name, "default-terminal", settings::TERM])?;
        // Windows opened later (split, new-window) get a desktop-like
        // login shell rather than inheriting the daemon's stripped PATH.
        self.run(&[
            "set-option",
            "-t",
            name,
            "default-command",
            &self.login_shell_command(),
        ])?;
        if disable_prefix {
            self.run(&["set-option", "-t", name, "prefix", "None"])?;
            self.run(&["set-option", "-t", name, "prefix2", "None"])?;
            self.run(&["set-option", "-t", name, "status", "off"])?;
            self.run(&["set-option", "-t", name, "mouse", "off"])?;
        }
        Ok(())
    }

    pub fn kill_session(&self, name: &str) -> Result<()> {
        self.run(&["kill-session", "-t", name])?;
        Ok(())
    }

    pub fn has_session(&self, name: &str) -> bool {
        Command::new(MUX_BIN)
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Whether the pane's command has exited, and with which code.
    pub fn pane_dead(&self, name: &str) -> Result<(bool, i32)> {
        let out = self.run(&[
            "display-message",
            "-p",
            "-t",
            name,
            "#{pane_dead} #{pane_dead_status}",
        ])?;
        Ok(parse_pane_state(&out))
    }

    /// Turn on mouse reporting. Used for the terminal-tab child, where the
    /// UI forwards wheel events as mouse sequences.
    pub fn enable_mouse(&self, name: &str) -> Result<()> {
        self.run(&["set-option", "-t", name, "mouse", "on"])?;
        Ok(())
    }

    pub fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        self.run(&[
            "resize-window",
            "-t",
            name,
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ])?;
        Ok(())
    }

    /// Start streaming the pane's raw output into a fresh FIFO.
    ///
    /// The FIFO is opened read+write so reads never see EOF while the
    /// pipe-pane writer is attaching late or momentarily detached.
    pub fn start_pipe_pane(&self, name: &str) -> Result<RawPipe> {
        let dir = settings::pipe_dir();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let path = dir.join(format!("{name}.pipe"));
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale pipe"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .map_err(|e| KojoError::Mux(format!("mkfifo {}: {e}", path.display())))?;

        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)
            .map_err(|e| KojoError::Mux(format!("open {}: {e}", path.display())))?;

        self.run(&[
            "pipe-pane",
            "-t",
            name,
            &format!("exec cat > {}", shell_quote(&path.to_string_lossy())),
        ])?;

        Ok(RawPipe { rx, path })
    }

    /// Stop the pipe-pane writer. An empty command argument turns it off.
    pub fn stop_pipe_pane(&self, name: &str) -> Result<()> {
        self.run(&["pipe-pane", "-t", name])?;
        Ok(())
    }

    /// Best-effort teardown of a session's pipe-pane state. The caller
    /// drops the FIFO handle itself.
    pub fn cleanup_pipe_pane(&self, name: &str, path: &Path) {
        if let Err(e) = self.stop_pipe_pane(name) {
            debug!(session = name, "stop pipe-pane: {e}");
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "remove pipe: {e}");
            }
        }
    }

    /// Current visible pane contents including escape sequences. Used once
    /// after reattach to seed scrollback.
    pub fn capture_pane_content(&self, name: &str) -> Result<String> {
        self.run(&["capture-pane", "-p", "-e", "-t", name])
    }

    /// All mux sessions the manager owns, running or not.
    pub fn list_kojo_sessions(&self) -> Result<Vec<String>> {
        let output = Command::new(MUX_BIN)
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .map_err(|e| KojoError::Mux(format!("{MUX_BIN} list-sessions: {e}")))?;
        if !output.status.success() {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with(SESSION_PREFIX))
            .map(|l| l.to_string())
            .collect())
    }

    /// Run an allowlisted action against a session.
    pub fn run_action(&self, name: &str, action: MuxAction) -> Result<()> {
        let argv = action.argv(name);
        let args: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
        self.run(&args)?;
        Ok(())
    }

    /// Shell invocation that clears `PATH` and execs the user's login shell
    /// with `-l`, so `PATH` is rebuilt by the profile the way a desktop
    /// terminal would.
    pub fn login_shell_command(&self) -> String {
        format!("PATH= exec {} -l", shell_quote(&settings::login_shell()))
    }

    /// Spawn an attach process bound to `name` under a fresh PTY.
    pub fn spawn_attach(&self, name: &str, cols: u16, rows: u16) -> Result<AttachHandle> {
        let args = vec!["attach-session".to_string(), "-t".to_string(), name.to_string()];
        spawn_pty(Path::new(MUX_BIN), &args, None, cols, rows)
    }
}

/// Spawn a process under a new PTY of the given dimensions (falling back to
/// 80x24 when either is zero).
pub fn spawn_pty(
    program: &Path,
    args: &[String],
    work_dir: Option<&Path>,
    cols: u16,
    rows: u16,
) -> Result<AttachHandle> {
    let size = PtySize {
        rows: if rows == 0 { DEFAULT_ROWS } else { rows },
        cols: if cols == 0 { DEFAULT_COLS } else { cols },
        pixel_width: 0,
        pixel_height: 0,
    };
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(size)
        .map_err(|e| KojoError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = work_dir {
        cmd.cwd(dir);
    }
    cmd.env("TERM", settings::TERM);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| KojoError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| KojoError::Pty(e.to_string()))?;

    Ok(AttachHandle {
        master: pair.master,
        writer,
        child,
    })
}

/// Remove FIFO files under `dir` left behind by sessions that are no
/// longer known.
pub fn cleanup_stale_pipes(dir: &Path, known: &HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        let Some(stem) = name.strip_suffix(".pipe") else {
            continue;
        };
        if stem.starts_with(SESSION_PREFIX) && !known.contains(stem) {
            debug!(path = %path.display(), "removing stale pipe");
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn parse_pane_state(output: &str) -> (bool, i32) {
    let mut parts = output.split_whitespace();
    let dead = parts.next() == Some("1");
    if !dead {
        return (false, 0);
    }
    let code = parts.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(1);
    (dead, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_prefixed() {
        let mux = MuxAdapter::new();
        assert_eq!(mux.session_name("s1234"), "kojo_s1234");
    }

    #[test]
    fn pane_state_parses_dead_and_alive() {
        assert_eq!(parse_pane_state("0 \n"), (false, 0));
        assert_eq!(parse_pane_state("1 130\n"), (true, 130));
        assert_eq!(parse_pane_state("1\n"), (true, 1));
        assert_eq!(parse_pane_state("1 garbage\n"), (true, 1));
    }

    #[test]
    fn action_allowlist_is_closed() {
        assert!(MuxAction::parse("kill-pane").is_ok());
        assert!(MuxAction::parse("copy-mode").is_ok());
        assert!(matches!(
            MuxAction::parse("run-shell"),
            Err(KojoError::UnknownAction(_))
        ));
    }

    #[test]
    fn actions_build_argv_without_shell_text() {
        let argv = MuxAction::SplitHorizontal.argv("kojo_s1");
        assert_eq!(argv, vec!["split-window", "-h", "-t", "kojo_s1"]);
        let argv = MuxAction::ResizePaneZoom.argv("kojo_s1");
        assert_eq!(argv, vec!["resize-pane", "-Z", "-t", "kojo_s1"]);
    }

    #[test]
    fn login_shell_command_clears_path() {
        let cmd = MuxAdapter::new().login_shell_command();
        assert!(cmd.starts_with("PATH= exec '"));
        assert!(cmd.ends_with("' -l"));
    }

    #[test]
    fn stale_pipe_cleanup_spares_known_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("kojo_keepme.pipe");
        let drop = dir.path().join("kojo_dropme.pipe");
        let other = dir.path().join("unrelated.pipe");
        std::fs::write(&keep, b"").unwrap();
        std::fs::write(&drop, b"").unwrap();
        std::fs::write(&other, b"").unwrap();

        let known: HashSet<String> = ["kojo_keepme".to_string()].into_iter().collect();
        cleanup_stale_pipes(dir.path(), &known);

        assert!(keep.exists());
        assert!(!drop.exists());
        // Files without the session prefix are never touched.
        assert!(other.exists());
    }
}
