//! Approval-prompt detection and tool session id capture.
//!
//! Both detectors work on a rolling tail of raw output bytes. The tail is
//! re-cleaned on every call so escape sequences split across read chunks
//! still strip correctly.

use once_cell::sync::Lazy;
use regex::Regex;

/// Raw bytes retained for approval-prompt matching.
const YOLO_TAIL_MAX: usize = 4096;

/// Raw bytes retained for tool session id matching.
const TOOL_ID_TAIL_MAX: usize = 256;

static APPROVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Do you \S[^?]*\?.{0,200}1\. Yes").unwrap());

static TOOL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)session id:\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    )
    .unwrap()
});

/// An approval-style prompt found in session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalMatch {
    /// The cleaned prompt text that matched.
    pub prompt: String,
}

/// Stateful per-session output scanner.
pub struct PromptDetector {
    yolo_tail: Vec<u8>,
    tool_id_tail: Vec<u8>,
    capture_tool_id: bool,
}

impl PromptDetector {
    /// `capture_tool_id` enables the session-id tail for tools that print
    /// their id to the terminal.
    pub fn new(capture_tool_id: bool) -> Self {
        Self {
            yolo_tail: Vec::new(),
            tool_id_tail: Vec::new(),
            capture_tool_id,
        }
    }

    /// Feed a chunk of output. Returns the approval match, if any, plus the
    /// full cleaned tail for debug observers.
    ///
    /// The tail is cleared on a match so the same prompt cannot fire twice.
    /// When `armed` is false no matching is attempted and the tail keeps
    /// accumulating.
    pub fn scan(&mut self, chunk: &[u8], armed: bool) -> (Option<ApprovalMatch>, String) {
        append_tail(&mut self.yolo_tail, chunk, YOLO_TAIL_MAX);
        let cleaned = clean_text(&self.yolo_tail);
        if !armed {
            return (None, cleaned);
        }
        match APPROVAL_RE.find(&cleaned) {
            Some(m) => {
                let prompt = cleaned[m.range()].to_string();
                self.yolo_tail.clear();
                (Some(ApprovalMatch { prompt }), cleaned)
            }
            None => (None, cleaned),
        }
    }

    /// Look for a tool-reported session id. Once captured, the buffer is
    /// cleared and capture stays disabled for the rest of the epoch.
    pub fn capture_tool_id(&mut self, chunk: &[u8]) -> Option<String> {
        if !self.capture_tool_id {
            return None;
        }
        append_tail(&mut self.tool_id_tail, chunk, TOOL_ID_TAIL_MAX);
        let cleaned = clean_text(&self.tool_id_tail);
        let captures = TOOL_ID_RE.captures(&cleaned)?;
        let id = captures[1].to_ascii_lowercase();
        self.tool_id_tail.clear();
        self.capture_tool_id = false;
        Some(id)
    }
}

fn append_tail(tail: &mut Vec<u8>, chunk: &[u8], max: usize) {
    tail.extend_from_slice(chunk);
    if tail.len() > max {
        let excess = tail.len() - max;
        tail.drain(..excess);
    }
}

/// Strip terminal control sequences, normalize line endings, and collapse
/// runs of spaces.
pub fn clean_text(input: &[u8]) -> String {
    let stripped = strip_controls(input);
    normalize_whitespace(&String::from_utf8_lossy(&stripped))
}

/// Replace recognized escape sequences with a single space: CSI sequences
/// (`ESC [` + parameter bytes 0x20-0x3F + final byte 0x40-0x7E), OSC
/// sequences (`ESC ]` ... BEL or `ESC \`), and charset designators
/// (`ESC ( x` / `ESC ) x`).
fn strip_controls(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != 0x1b {
            out.push(input[i]);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            Some(b'[') => {
                let mut j = i + 2;
                while j < input.len() && (0x20..=0x3f).contains(&input[j]) {
                    j += 1;
                }
                if j < input.len() {
                    j += 1; // final byte
                }
                out.push(b' ');
                i = j;
            }
            Some(b']') => {
                let mut j = i + 2;
                loop {
                    match input.get(j) {
                        None => break,
                        Some(0x07) => {
                            j += 1;
                            break;
                        }
                        Some(0x1b) if input.get(j + 1) == Some(&b'\\') => {
                            j += 2;
                            break;
                        }
                        Some(_) => j += 1,
                    }
                }
                out.push(b' ');
                i = j;
            }
            Some(b'(') | Some(b')') => {
                out.push(b' ');
                i = (i + 3).min(input.len());
            }
            Some(_) => {
                out.push(b' ');
                i += 2;
            }
            None => {
                out.push(b' ');
                i += 1;
            }
        }
    }
    out
}

fn normalize_whitespace(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut prev_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(clean_text(b"\x1b[1mbold\x1b[0m"), " bold ");
        // tilde-terminated CSI
        assert_eq!(clean_text(b"a\x1b[15~b"), "a b");
    }

    #[test]
    fn strips_osc_sequences() {
        assert_eq!(clean_text(b"x\x1b]0;title\x07y"), "x y");
        assert_eq!(clean_text(b"x\x1b]0;title\x1b\\y"), "x y");
    }

    #[test]
    fn strips_charset_designators() {
        assert_eq!(clean_text(b"a\x1b(Bb\x1b)0c"), "a b c");
    }

    #[test]
    fn normalizes_carriage_returns_and_spaces() {
        assert_eq!(clean_text(b"one\r\ntwo\rthree"), "one\ntwo\nthree");
        assert_eq!(clean_text(b"a    b"), "a b");
    }

    #[test]
    fn detects_prompt_and_clears_tail() {
        let mut det = PromptDetector::new(false);
        let (hit, tail) = det.scan(b"Do you want to proceed? \n \xe2\x9d\xaf 1. Yes", true);
        let hit = hit.expect("prompt should match");
        assert!(hit.prompt.starts_with("Do you want to proceed?"));
        assert!(tail.contains("1. Yes"));

        // Tail was cleared; unrelated output cannot re-match.
        let (hit, _) = det.scan(b"2. No, and tell Claude what to do differently", true);
        assert!(hit.is_none());
    }

    #[test]
    fn detects_prompt_with_escape_sequences() {
        let mut det = PromptDetector::new(false);
        let chunk = b"\x1b[1mDo you want to proceed?\x1b[0m\r\n\x1b[32m\xe2\x9d\xaf 1. Yes\x1b[0m";
        let (hit, _) = det.scan(chunk, true);
        assert!(hit.is_some());
    }

    #[test]
    fn detects_prompt_after_long_prefix() {
        let mut det = PromptDetector::new(false);
        let noise = vec![b'x'; 6000];
        let (hit, _) = det.scan(&noise, true);
        assert!(hit.is_none());
        let (hit, _) = det.scan(b"Do you trust the files in this folder? 1. Yes", true);
        assert!(hit.is_some());
    }

    #[test]
    fn detects_prompt_split_across_chunks() {
        let mut det = PromptDetector::new(false);
        let (hit, _) = det.scan(b"Do you want to run this co", true);
        assert!(hit.is_none());
        let (hit, _) = det.scan(b"mmand?\n 1. Yes\n 2. No", true);
        assert!(hit.is_some());
    }

    #[test]
    fn disarmed_scan_never_matches() {
        let mut det = PromptDetector::new(false);
        let (hit, tail) = det.scan(b"Do you want to proceed? 1. Yes", false);
        assert!(hit.is_none());
        assert!(tail.contains("Do you want to proceed?"));

        // The pattern is still in the tail, so arming later matches.
        let (hit, _) = det.scan(b"", true);
        assert!(hit.is_some());
    }

    #[test]
    fn ignores_text_beyond_the_window() {
        let mut det = PromptDetector::new(false);
        // The answer option arrives more than 200 characters after the
        // question, which is outside the prompt shape.
        let mut chunk = b"Do you want to proceed?".to_vec();
        chunk.extend(std::iter::repeat(b'-').take(300));
        chunk.extend_from_slice(b"1. Yes");
        let (hit, _) = det.scan(&chunk, true);
        assert!(hit.is_none());
    }

    #[test]
    fn captures_tool_session_id_once() {
        let mut det = PromptDetector::new(true);
        assert!(det.capture_tool_id(b"booting...").is_none());
        let id = det
            .capture_tool_id(b"session id: 0193C5A2-6FDE-7A31-9E6B-1234567890AB\n")
            .expect("uuid should be captured");
        assert_eq!(id, "0193c5a2-6fde-7a31-9e6b-1234567890ab");

        // Capture is one-shot per epoch.
        assert!(det
            .capture_tool_id(b"session id: ffffffff-ffff-ffff-ffff-ffffffffffff")
            .is_none());
    }

    #[test]
    fn capture_disabled_for_other_tools() {
        let mut det = PromptDetector::new(false);
        assert!(det
            .capture_tool_id(b"session id: 0193c5a2-6fde-7a31-9e6b-1234567890ab")
            .is_none());
    }
}
