//! Per-session record: mutable state, subscriber fan-out, scrollback.
//!
//! A `Session` owns everything specific to one child process: its ring
//! buffer, the attach PTY handles of the current epoch, and the table of
//! subscriber channels. The manager owns the map of sessions and drives
//! the lifecycle; subscribers only ever touch their own channel.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kojo_core::{KojoError, PersistedSession, Result, SessionInfo, SessionStatus, ToolKind};
use portable_pty::{MasterPty, PtySize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::detector::{ApprovalMatch, PromptDetector};
use crate::mux::MuxAdapter;
use crate::ring::{RingBuffer, DEFAULT_CAPACITY};

/// Capacity of each subscriber's chunk channel. A subscriber that falls
/// this far behind starts losing chunks, not the session.
pub const SUBSCRIBER_BUFFER: usize = 512;

const WRITE_RETRIES: usize = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Trailing scrollback captured as `lastOutput` when an epoch ends.
pub(crate) const EXIT_TAIL_BYTES: usize = 8192;

/// A byte-chunk subscription: the scrollback snapshot taken at registration
/// plus a bounded live channel carrying everything produced after it.
pub struct Subscription {
    pub id: u64,
    pub snapshot: Vec<u8>,
    pub rx: tokio::sync::mpsc::Receiver<Bytes>,
}

/// A prompt-detector diagnostics subscription.
pub struct DebugSubscription {
    pub id: u64,
    pub rx: tokio::sync::mpsc::Receiver<String>,
}

/// Mutable, epoch-scoped session state. Guarded by the record mutex; never
/// held across an await point.
pub(crate) struct SessionState {
    pub args: Vec<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub restarting: bool,
    pub tool_session_id: Option<String>,
    pub mux_name: Option<String>,
    pub last_cols: u16,
    pub last_rows: u16,
    pub last_output: Option<Vec<u8>>,
    pub master: Option<Box<dyn MasterPty + Send>>,
    pub writer: Option<Box<dyn Write + Send>>,
    pub child_pid: Option<u32>,
    pub pipe_active: bool,
    pub raw_pipe_path: Option<PathBuf>,
    /// Closed exactly once when the current epoch terminates.
    pub done: CancellationToken,
    /// Closed when the current epoch's read loop has returned.
    pub read_done: CancellationToken,
}

struct Subscribers {
    next_id: u64,
    chunks: HashMap<u64, tokio::sync::mpsc::Sender<Bytes>>,
    debug: HashMap<u64, tokio::sync::mpsc::Sender<String>>,
}

pub struct Session {
    pub id: String,
    pub tool: ToolKind,
    pub work_dir: PathBuf,
    pub parent_id: Option<String>,
    pub internal: bool,
    pub created_at: DateTime<Utc>,

    yolo: AtomicBool,
    pub(crate) ring: RingBuffer,
    pub(crate) state: Mutex<SessionState>,
    subscribers: Mutex<Subscribers>,
    detector: Mutex<PromptDetector>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        tool: ToolKind,
        work_dir: PathBuf,
        args: Vec<String>,
        yolo_mode: bool,
        parent_id: Option<String>,
        internal: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        // Fresh records have no live epoch: both tokens start closed so
        // Write bails immediately instead of spinning.
        let done = CancellationToken::new();
        done.cancel();
        let read_done = CancellationToken::new();
        read_done.cancel();

        Self {
            id,
            tool,
            work_dir,
            parent_id,
            internal,
            created_at,
            yolo: AtomicBool::new(yolo_mode),
            ring: RingBuffer::new(DEFAULT_CAPACITY),
            state: Mutex::new(SessionState {
                args,
                status: SessionStatus::Exited,
                exit_code: None,
                restarting: false,
                tool_session_id: None,
                mux_name: None,
                last_cols: 0,
                last_rows: 0,
                last_output: None,
                master: None,
                writer: None,
                child_pid: None,
                pipe_active: false,
                raw_pipe_path: None,
                done,
                read_done,
            }),
            subscribers: Mutex::new(Subscribers {
                next_id: 0,
                chunks: HashMap::new(),
                debug: HashMap::new(),
            }),
            detector: Mutex::new(PromptDetector::new(tool.prints_session_id())),
        }
    }

    /// Reset the prompt detector for a fresh epoch.
    pub(crate) fn reset_detector(&self) {
        *self.detector.lock().unwrap() = PromptDetector::new(self.tool.prints_session_id());
    }

    /// Register a subscriber. The snapshot is taken under the subscriber
    /// lock, so the returned channel carries only chunks produced strictly
    /// after the snapshot: no duplication, no gap.
    pub fn subscribe(&self) -> Subscription {
        let mut subs = self.subscribers.lock().unwrap();
        let snapshot = self.ring.snapshot();
        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_BUFFER);
        let id = subs.next_id;
        subs.next_id += 1;
        subs.chunks.insert(id, tx);
        Subscription { id, snapshot, rx }
    }

    /// Remove a subscriber; dropping its sender closes the channel.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().chunks.remove(&id);
    }

    /// Register an observer of the prompt detector's cleaned tail.
    pub fn subscribe_debug(&self) -> DebugSubscription {
        let mut subs = self.subscribers.lock().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_BUFFER);
        let id = subs.next_id;
        subs.next_id += 1;
        subs.debug.insert(id, tx);
        DebugSubscription { id, rx }
    }

    pub fn unsubscribe_debug(&self, id: u64) {
        self.subscribers.lock().unwrap().debug.remove(&id);
    }

    /// Record a chunk of output: scrollback first, then every live
    /// subscriber. Sends are non-blocking; a full channel drops the chunk
    /// for that subscriber only.
    pub(crate) fn ingest(&self, data: &[u8]) {
        let subs = self.subscribers.lock().unwrap();
        self.ring.write(data);
        if subs.chunks.is_empty() {
            return;
        }
        let chunk = Bytes::copy_from_slice(data);
        for tx in subs.chunks.values() {
            let _ = tx.try_send(chunk.clone());
        }
    }

    fn broadcast_debug(&self, text: &str) {
        let subs = self.subscribers.lock().unwrap();
        if subs.debug.is_empty() {
            return;
        }
        for tx in subs.debug.values() {
            let _ = tx.try_send(text.to_string());
        }
    }

    /// Scan a chunk for an approval prompt. Returns a match only while
    /// auto-approve is armed; the cleaned tail always goes to debug
    /// observers.
    pub fn check_yolo(&self, chunk: &[u8]) -> Option<ApprovalMatch> {
        let armed = self.is_yolo_mode();
        let (matched, tail) = self.detector.lock().unwrap().scan(chunk, armed);
        self.broadcast_debug(&tail);
        matched
    }

    /// Capture a tool-reported session id from output, once per epoch. The
    /// stored id is only ever assigned if none is known yet.
    pub fn capture_tool_session_id(&self, chunk: &[u8]) -> Option<String> {
        let id = self.detector.lock().unwrap().capture_tool_id(chunk)?;
        let mut state = self.state.lock().unwrap();
        if state.tool_session_id.is_none() {
            state.tool_session_id = Some(id.clone());
        }
        Some(id)
    }

    pub fn set_yolo_mode(&self, on: bool) {
        self.yolo.store(on, Ordering::SeqCst);
    }

    pub fn is_yolo_mode(&self) -> bool {
        self.yolo.load(Ordering::SeqCst)
    }

    /// Send bytes to the attach PTY.
    ///
    /// The PTY is transiently absent during reattach; retry a few times,
    /// bailing out as soon as the epoch terminates.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let done = self.state.lock().unwrap().done.clone();
        for attempt in 0..WRITE_RETRIES {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(writer) = state.writer.as_mut() {
                    writer
                        .write_all(data)
                        .map_err(|e| KojoError::Pty(e.to_string()))?;
                    writer.flush().map_err(|e| KojoError::Pty(e.to_string()))?;
                    return Ok(());
                }
            }
            if attempt + 1 == WRITE_RETRIES {
                break;
            }
            tokio::select! {
                _ = done.cancelled() => return Err(KojoError::StreamClosed),
                _ = tokio::time::sleep(WRITE_RETRY_DELAY) => {}
            }
        }
        Err(KojoError::StreamClosed)
    }

    /// Set the PTY window size; mux-backed sessions also resize the backing
    /// pane when the dimensions actually changed. The deduplication state
    /// is only updated after both succeed.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let (mux_name, dims_changed) = {
            let state = self.state.lock().unwrap();
            if let Some(master) = state.master.as_ref() {
                master
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|e| KojoError::Pty(e.to_string()))?;
            }
            (
                state.mux_name.clone(),
                state.last_cols != cols || state.last_rows != rows,
            )
        };

        if dims_changed {
            if let Some(name) = &mux_name {
                MuxAdapter::new().resize_pane(name, cols, rows)?;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.last_cols = cols;
        state.last_rows = rows;
        Ok(())
    }

    /// Immutable snapshot of the session's metadata.
    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock().unwrap();
        SessionInfo {
            id: self.id.clone(),
            tool: self.tool,
            work_dir: self.work_dir.clone(),
            args: state.args.clone(),
            status: state.status,
            exit_code: state.exit_code,
            yolo_mode: self.is_yolo_mode(),
            internal: self.internal,
            created_at: self.created_at,
            tool_session_id: state.tool_session_id.clone(),
            parent_id: self.parent_id.clone(),
            mux_name: state.mux_name.clone(),
            last_cols: state.last_cols,
            last_rows: state.last_rows,
        }
    }

    /// Signal closed when the current epoch terminates.
    pub fn done(&self) -> CancellationToken {
        self.state.lock().unwrap().done.clone()
    }

    pub(crate) fn read_done(&self) -> CancellationToken {
        self.state.lock().unwrap().read_done.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    pub(crate) fn mux_name(&self) -> Option<String> {
        self.state.lock().unwrap().mux_name.clone()
    }

    /// Persistence record for the current state.
    pub(crate) fn persist_record(&self) -> PersistedSession {
        let info = self.info();
        let last_output = self.state.lock().unwrap().last_output.clone();
        PersistedSession::from_info(&info, last_output.as_deref())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .field("work_dir", &self.work_dir)
            .field("status", &state.status)
            .field("mux_name", &state.mux_name)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s0000000000000001".to_string(),
            ToolKind::Claude,
            PathBuf::from("/tmp"),
            vec!["--model".to_string(), "opus".to_string()],
            false,
            None,
            false,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn subscribe_sees_snapshot_then_stream_without_overlap() {
        let session = session();
        session.ingest(b"AAAA");
        session.ingest(b"BBBB");

        let mut sub = session.subscribe();
        assert_eq!(sub.snapshot, b"AAAABBBB");

        session.ingest(b"CCCC");
        let chunk = sub.rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b"CCCC");

        // Nothing else is pending: no duplicated bytes.
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let session = session();
        let mut sub = session.subscribe();
        session.unsubscribe(sub.id);
        session.ingest(b"after");
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_chunks_silently() {
        let session = session();
        let mut sub = session.subscribe();
        for _ in 0..(SUBSCRIBER_BUFFER + 100) {
            session.ingest(b"x");
        }
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn debug_subscribers_see_cleaned_tail() {
        let session = session();
        let mut debug = session.subscribe_debug();
        session.check_yolo(b"\x1b[1mhello\x1b[0m");
        let tail = debug.rx.recv().await.unwrap();
        assert_eq!(tail, " hello ");
    }

    #[tokio::test]
    async fn check_yolo_respects_mode() {
        let session = session();
        assert!(session.check_yolo(b"Do you want to proceed? 1. Yes").is_none());

        session.set_yolo_mode(true);
        // Pattern still in the tail from the disarmed call.
        assert!(session.check_yolo(b"").is_some());
    }

    struct SharedWriter(std::sync::Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_reaches_the_installed_writer() {
        let session = session();
        let sink = std::sync::Arc::new(Mutex::new(Vec::new()));
        {
            let mut state = session.state.lock().unwrap();
            state.writer = Some(Box::new(SharedWriter(sink.clone())));
            state.done = CancellationToken::new();
            state.status = SessionStatus::Running;
        }
        session.write(b"\r").await.unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), b"\r");
    }

    #[tokio::test(start_paused = true)]
    async fn write_without_pty_bails_after_retries() {
        let session = session();
        // Give the record a live epoch with no writer installed.
        {
            let mut state = session.state.lock().unwrap();
            state.done = CancellationToken::new();
            state.status = SessionStatus::Running;
        }
        let err = session.write(b"hi").await.unwrap_err();
        assert!(matches!(err, KojoError::StreamClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn write_bails_early_when_epoch_ends() {
        let session = session();
        let done = CancellationToken::new();
        {
            let mut state = session.state.lock().unwrap();
            state.done = done.clone();
            state.status = SessionStatus::Running;
        }
        let write = tokio::spawn(async move { session.write(b"hi").await });
        done.cancel();
        let err = write.await.unwrap().unwrap_err();
        assert!(matches!(err, KojoError::StreamClosed));
    }

    #[tokio::test]
    async fn captured_tool_id_does_not_clobber_existing() {
        let session = Session::new(
            "s0000000000000002".to_string(),
            ToolKind::Codex,
            PathBuf::from("/tmp"),
            vec![],
            false,
            None,
            false,
            Utc::now(),
        );
        session.state.lock().unwrap().tool_session_id = Some("preassigned".to_string());
        let captured = session
            .capture_tool_session_id(b"session id: 0193c5a2-6fde-7a31-9e6b-1234567890ab");
        assert!(captured.is_some());
        assert_eq!(
            session.info().tool_session_id.as_deref(),
            Some("preassigned")
        );
    }
}
