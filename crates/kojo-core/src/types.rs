//! Session data model shared between the manager, the store, and clients.

use crate::tools::ToolKind;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Immutable snapshot of a session's metadata.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub tool: ToolKind,
    pub work_dir: PathBuf,
    /// Original invocation arguments, without auto-added resume flags.
    pub args: Vec<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub yolo_mode: bool,
    pub internal: bool,
    pub created_at: DateTime<Utc>,
    pub tool_session_id: Option<String>,
    pub parent_id: Option<String>,
    pub mux_name: Option<String>,
    pub last_cols: u16,
    pub last_rows: u16,
}

impl SessionInfo {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// One entry of the sessions file.
///
/// Field names and encodings are the wire contract: camelCase keys,
/// integers as JSON numbers, `lastOutput` as standard base64, `createdAt`
/// as RFC-3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    pub tool: String,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub yolo_mode: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rows: Option<u16>,
}

impl PersistedSession {
    /// Build a persistence record from a metadata snapshot plus the raw
    /// trailing output captured at exit.
    pub fn from_info(info: &SessionInfo, last_output: Option<&[u8]>) -> Self {
        Self {
            id: info.id.clone(),
            tool: info.tool.name().to_string(),
            work_dir: info.work_dir.clone(),
            args: info.args.clone(),
            status: info.status,
            exit_code: info.exit_code,
            yolo_mode: info.yolo_mode,
            internal: info.internal,
            created_at: info.created_at,
            tool_session_id: info.tool_session_id.clone(),
            parent_id: info.parent_id.clone(),
            mux_name: info.mux_name.clone(),
            last_output: last_output.map(|b| BASE64.encode(b)),
            last_cols: (info.last_cols > 0).then_some(info.last_cols),
            last_rows: (info.last_rows > 0).then_some(info.last_rows),
        }
    }

    /// Decode `lastOutput` back into raw bytes. Invalid base64 (a hand-edited
    /// file) is treated as absent rather than failing the whole load.
    pub fn decode_last_output(&self) -> Option<Vec<u8>> {
        self.last_output.as_deref().and_then(|s| BASE64.decode(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> SessionInfo {
        SessionInfo {
            id: "s00000000000000ab".to_string(),
            tool: ToolKind::Claude,
            work_dir: PathBuf::from("/tmp/x"),
            args: vec!["--model".to_string(), "opus".to_string()],
            status: SessionStatus::Exited,
            exit_code: Some(0),
            yolo_mode: true,
            internal: false,
            created_at: Utc::now(),
            tool_session_id: Some("uuid-1".to_string()),
            parent_id: None,
            mux_name: Some("kojo_s00000000000000ab".to_string()),
            last_cols: 120,
            last_rows: 40,
        }
    }

    #[test]
    fn wire_format_uses_camel_case_and_base64() {
        let rec = PersistedSession::from_info(&sample_info(), Some(&b"bye\n"[..]));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"workDir\""));
        assert!(json.contains("\"yoloMode\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"toolSessionId\""));
        assert!(json.contains("\"muxName\""));
        assert!(json.contains(&format!("\"lastOutput\":\"{}\"", BASE64.encode(b"bye\n"))));
        // internal=false is omitted entirely
        assert!(!json.contains("\"internal\""));
        assert!(json.contains("\"status\":\"exited\""));
    }

    #[test]
    fn round_trip_preserves_fields() {
        let rec = PersistedSession::from_info(&sample_info(), Some(&b"tail"[..]));
        let json = serde_json::to_string(&rec).unwrap();
        let back: PersistedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, rec.id);
        assert_eq!(back.tool, "claude");
        assert_eq!(back.args, rec.args);
        assert_eq!(back.exit_code, Some(0));
        assert_eq!(back.last_cols, Some(120));
        assert_eq!(back.decode_last_output().unwrap(), b"tail");
    }

    #[test]
    fn invalid_base64_is_treated_as_absent() {
        let mut rec = PersistedSession::from_info(&sample_info(), None);
        rec.last_output = Some("not base64!!".to_string());
        assert!(rec.decode_last_output().is_none());
    }

    #[test]
    fn minimal_record_parses_with_defaults() {
        let json = r#"{
            "id": "s1",
            "tool": "codex",
            "workDir": "/tmp",
            "status": "running",
            "yoloMode": false,
            "createdAt": "2026-07-01T10:00:00Z"
        }"#;
        let rec: PersistedSession = serde_json::from_str(json).unwrap();
        assert!(rec.args.is_empty());
        assert!(!rec.internal);
        assert!(rec.mux_name.is_none());
        assert_eq!(rec.status, SessionStatus::Running);
    }
}
