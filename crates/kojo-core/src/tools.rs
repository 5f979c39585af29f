//! Interactive-tool allowlist and per-tool argument builders.
//!
//! Only programs in this closed set are ever launched. Each variant knows
//! how to pre-assign or re-use a tool-side conversation id so that a
//! restarted session resumes where it left off.

use crate::error::{KojoError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A program from the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Claude Code. Accepts a pre-assigned `--session-id` and resumes with
    /// `--resume <id>` / `--continue`.
    Claude,
    /// Codex CLI. Prints its session id to the terminal; resumes with the
    /// `resume` subcommand.
    Codex,
    /// Gemini CLI. Resumes with `--resume latest`.
    Gemini,
    /// The mux itself, exposed as the terminal tab of another session.
    Terminal,
}

impl ToolKind {
    /// User-facing tools (everything except the internal terminal).
    pub const USER_TOOLS: [ToolKind; 3] = [ToolKind::Claude, ToolKind::Codex, ToolKind::Gemini];

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "claude" => Ok(ToolKind::Claude),
            "codex" => Ok(ToolKind::Codex),
            "gemini" => Ok(ToolKind::Gemini),
            "terminal" => Ok(ToolKind::Terminal),
            other => Err(KojoError::UnsupportedTool(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Claude => "claude",
            ToolKind::Codex => "codex",
            ToolKind::Gemini => "gemini",
            ToolKind::Terminal => "terminal",
        }
    }

    /// Sessions created solely to back another session.
    pub fn is_internal(self) -> bool {
        matches!(self, ToolKind::Terminal)
    }

    /// Whether the tool reports its session id on the terminal, to be
    /// captured from output once.
    pub fn prints_session_id(self) -> bool {
        matches!(self, ToolKind::Codex)
    }

    /// Whether the manager assigns the tool session id up front.
    pub fn preassigns_session_id(self) -> bool {
        matches!(self, ToolKind::Claude)
    }

    /// The program resolved on the search path. The internal terminal tool
    /// launches the mux binary itself.
    pub fn program(self) -> &'static str {
        match self {
            ToolKind::Terminal => "tmux",
            other => other.name(),
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Availability of a single tool on this machine.
#[derive(Debug, Clone)]
pub struct ToolStatus {
    pub available: bool,
    pub path: Option<PathBuf>,
}

/// Report availability of every user tool on the search path.
pub fn availability() -> BTreeMap<&'static str, ToolStatus> {
    let mut report = BTreeMap::new();
    for tool in ToolKind::USER_TOOLS {
        let path = which::which(tool.program()).ok();
        report.insert(
            tool.name(),
            ToolStatus {
                available: path.is_some(),
                path,
            },
        );
    }
    report
}

/// Resolve a tool to an absolute path, failing if it is not installed.
pub fn resolve_path(tool: ToolKind) -> Result<PathBuf> {
    which::which(tool.program()).map_err(|_| KojoError::ToolNotFound(tool.program().to_string()))
}

/// Args the child process is actually launched with at Create.
///
/// The caller keeps the original args for persistence; anything injected
/// here never reaches the store.
pub fn launch_args(tool: ToolKind, args: &[String], tool_session_id: Option<&str>) -> Vec<String> {
    match tool {
        ToolKind::Claude => {
            let mut out = args.to_vec();
            if let Some(id) = tool_session_id {
                if !args.iter().any(|a| a == "--session-id") {
                    out.push("--session-id".to_string());
                    out.push(id.to_string());
                }
            }
            out
        }
        _ => args.to_vec(),
    }
}

/// The fixed invocation for the internal terminal tool: attach-or-create a
/// mux session of the given name in the given directory.
pub fn terminal_args(session_name: &str, work_dir: &std::path::Path) -> Vec<String> {
    vec![
        "new-session".to_string(),
        "-A".to_string(),
        "-s".to_string(),
        session_name.to_string(),
        "-c".to_string(),
        work_dir.to_string_lossy().into_owned(),
    ]
}

/// Build the argument list for relaunching a tool so that it resumes its
/// previous conversation. Original args are never mutated in place.
pub fn restart_args(
    tool: ToolKind,
    original: &[String],
    tool_session_id: Option<&str>,
) -> Vec<String> {
    match tool {
        ToolKind::Claude => {
            let mut out = strip_flag_with_value(original, &["--resume", "-r"]);
            out = strip_flag(&out, &["--continue", "-c"]);
            match tool_session_id {
                Some(id) => {
                    out.push("--resume".to_string());
                    out.push(id.to_string());
                }
                None => out.push("--continue".to_string()),
            }
            out
        }
        ToolKind::Codex => match tool_session_id {
            Some(id) => vec!["resume".to_string(), id.to_string()],
            None => vec!["resume".to_string(), "--last".to_string()],
        },
        ToolKind::Gemini => {
            let mut out = strip_flag_with_value(original, &["--resume", "-r"]);
            out.push("--resume".to_string());
            out.push("latest".to_string());
            out
        }
        ToolKind::Terminal => match tool_session_id {
            Some(id) => vec![
                "new-session".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                id.to_string(),
            ],
            None => original.to_vec(),
        },
    }
}

/// Remove every occurrence of the given flags along with their value.
fn strip_flag_with_value(args: &[String], flags: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if flags.contains(&arg.as_str()) {
            // Consume the value unless the next token is another flag.
            if let Some(next) = iter.peek() {
                if !next.starts_with('-') {
                    iter.next();
                }
            }
            continue;
        }
        if flags.iter().any(|f| {
            f.starts_with("--") && arg.starts_with(&format!("{f}="))
        }) {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Remove every occurrence of the given value-less flags.
fn strip_flag(args: &[String], flags: &[&str]) -> Vec<String> {
    args.iter()
        .filter(|a| !flags.contains(&a.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_rejects_unknown_tool() {
        assert!(matches!(
            ToolKind::parse("bash"),
            Err(KojoError::UnsupportedTool(_))
        ));
        assert_eq!(ToolKind::parse("claude").unwrap(), ToolKind::Claude);
    }

    #[test]
    fn launch_args_injects_session_id_once() {
        let original = args(&["--model", "opus"]);
        let launched = launch_args(ToolKind::Claude, &original, Some("abc-123"));
        assert_eq!(launched, args(&["--model", "opus", "--session-id", "abc-123"]));

        // Already present: leave the caller's flag alone.
        let explicit = args(&["--session-id", "theirs"]);
        let launched = launch_args(ToolKind::Claude, &explicit, Some("abc-123"));
        assert_eq!(launched, explicit);

        // The original args are not mutated.
        assert_eq!(original, args(&["--model", "opus"]));
    }

    #[test]
    fn launch_args_passthrough_for_other_tools() {
        let original = args(&["--sandbox"]);
        assert_eq!(launch_args(ToolKind::Codex, &original, None), original);
    }

    #[test]
    fn claude_restart_prefers_known_session() {
        let original = args(&["--model", "opus", "--continue"]);
        let rebuilt = restart_args(ToolKind::Claude, &original, Some("abc"));
        assert_eq!(rebuilt, args(&["--model", "opus", "--resume", "abc"]));
    }

    #[test]
    fn claude_restart_strips_stale_resume() {
        let original = args(&["--resume", "old-id", "--model", "opus"]);
        let rebuilt = restart_args(ToolKind::Claude, &original, None);
        assert_eq!(rebuilt, args(&["--model", "opus", "--continue"]));
    }

    #[test]
    fn claude_restart_strips_short_flags() {
        let original = args(&["-r", "old", "-c", "--model", "opus"]);
        let rebuilt = restart_args(ToolKind::Claude, &original, Some("new"));
        assert_eq!(rebuilt, args(&["--model", "opus", "--resume", "new"]));
    }

    #[test]
    fn codex_restart_uses_resume_subcommand() {
        assert_eq!(
            restart_args(ToolKind::Codex, &args(&["--sandbox"]), Some("uuid-1")),
            args(&["resume", "uuid-1"])
        );
        assert_eq!(
            restart_args(ToolKind::Codex, &[], None),
            args(&["resume", "--last"])
        );
    }

    #[test]
    fn gemini_restart_resumes_latest() {
        let original = args(&["--resume", "x", "--yolo"]);
        assert_eq!(
            restart_args(ToolKind::Gemini, &original, None),
            args(&["--yolo", "--resume", "latest"])
        );
    }

    #[test]
    fn terminal_restart_reattaches_by_name() {
        assert_eq!(
            restart_args(ToolKind::Terminal, &[], Some("kojo_s1")),
            args(&["new-session", "-A", "-s", "kojo_s1"])
        );
    }

    #[test]
    fn strip_flag_keeps_following_flag() {
        // A resume flag at the end, or followed by another flag, has no value.
        let out = strip_flag_with_value(&args(&["--resume", "--model", "opus"]), &["--resume"]);
        assert_eq!(out, args(&["--model", "opus"]));
    }

    #[test]
    fn availability_covers_all_user_tools() {
        let report = availability();
        assert_eq!(report.len(), ToolKind::USER_TOOLS.len());
        for tool in ToolKind::USER_TOOLS {
            assert!(report.contains_key(tool.name()));
        }
    }
}
