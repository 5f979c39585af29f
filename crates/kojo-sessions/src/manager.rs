//! Session lifecycle orchestration.
//!
//! The manager owns the id -> session map and everything that moves a
//! session between states: launching the tool inside a detached mux
//! session, attaching to it, streaming its output, polling the pane for
//! death, reattaching when the attach process drops, and tearing the
//! whole thing down again. Detached mux sessions survive the host, which
//! is what makes restart recovery possible.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use kojo_core::{ids, tools, KojoError, PersistedSession, Result, SessionStatus, ToolKind, ToolStatus};
use tokio::net::unix::pipe;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mux::{self, AttachHandle, MuxAction, MuxAdapter, RawPipe};
use crate::session::{Session, EXIT_TAIL_BYTES};
use crate::store::SessionStore;

const PANE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PANE_ERROR_LIMIT: u32 = 10;
const YOLO_REPLY_DELAY: Duration = Duration::from_millis(100);
const STOP_KILL_TIMEOUT: Duration = Duration::from_secs(5);
const STOPALL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const READER_CHUNK: usize = 4096;
const MOUSE_ENABLE_DELAY: Duration = Duration::from_millis(500);

/// At most one observer, invoked once per epoch termination.
pub type ExitHook = Box<dyn Fn(Arc<Session>) + Send + Sync>;

pub struct CreateRequest {
    pub tool: ToolKind,
    pub work_dir: PathBuf,
    pub args: Vec<String>,
    pub yolo_mode: bool,
    pub parent_id: Option<String>,
    /// Initial terminal dimensions; zero means default.
    pub cols: u16,
    pub rows: u16,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    mux: MuxAdapter,
    store: SessionStore,
    shutting_down: AtomicBool,
    on_exit: StdMutex<Option<ExitHook>>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                mux: MuxAdapter::new(),
                store,
                shutting_down: AtomicBool::new(false),
                on_exit: StdMutex::new(None),
            }),
        }
    }

    /// Register the single exit observer, replacing any previous one.
    pub fn set_on_exit(&self, hook: ExitHook) {
        *self.inner.on_exit.lock().unwrap() = Some(hook);
    }

    /// Availability of each user tool on this machine.
    pub fn tool_availability() -> BTreeMap<&'static str, ToolStatus> {
        tools::availability()
    }

    /// Load persisted sessions, reattach the ones whose mux sessions are
    /// still alive, and clean up orphans.
    ///
    /// Orphan cleanup only runs after a successful load: treating a parse
    /// failure as "no known sessions" would mass-kill live mux sessions.
    pub async fn startup(&self) -> Result<()> {
        let inner = &self.inner;
        let loaded = match inner.store.load() {
            Ok(list) => list,
            Err(e) => {
                warn!("session store unreadable; skipping orphan cleanup: {e}");
                return Ok(());
            }
        };
        info!("loaded {} persisted sessions", loaded.len());

        let mut known_running: HashSet<String> = HashSet::new();

        for record in loaded {
            let tool = match ToolKind::parse(&record.tool) {
                Ok(tool) => tool,
                Err(e) => {
                    warn!(session = %record.id, "skipping persisted session: {e}");
                    continue;
                }
            };

            let session = Arc::new(Session::new(
                record.id.clone(),
                tool,
                record.work_dir.clone(),
                record.args.clone(),
                record.yolo_mode,
                record.parent_id.clone(),
                record.internal,
                record.created_at,
            ));
            {
                let mut state = session.state.lock().unwrap();
                state.exit_code = record.exit_code;
                state.tool_session_id = record.tool_session_id.clone();
                state.mux_name = record.mux_name.clone();
                state.last_cols = record.last_cols.unwrap_or(0);
                state.last_rows = record.last_rows.unwrap_or(0);
                state.last_output = record.decode_last_output();
            }

            if let Some(name) = record.mux_name.clone() {
                if inner.mux.has_session(&name) {
                    match inner.mux.pane_dead(&name) {
                        Ok((false, _)) => {
                            if self.resume_session(&session, &name).await {
                                known_running.insert(name);
                            }
                        }
                        Ok((true, code)) => {
                            debug!(session = %session.id, "mux pane already dead");
                            session.state.lock().unwrap().exit_code = Some(code);
                            let _ = inner.mux.kill_session(&name);
                        }
                        Err(e) => {
                            warn!(session = %session.id, "pane state unknown, killing remnant: {e}");
                            let _ = inner.mux.kill_session(&name);
                        }
                    }
                }
            }

            {
                let mut state = session.state.lock().unwrap();
                if state.status == SessionStatus::Exited && state.exit_code.is_none() {
                    state.exit_code = Some(1);
                }
            }
            inner.sessions.write().await.insert(session.id.clone(), session);
        }

        // Anything named kojo_* that we do not know to be running is an
        // orphan from a previous life.
        match inner.mux.list_kojo_sessions() {
            Ok(names) => {
                for name in names {
                    if !known_running.contains(&name) {
                        info!(mux_session = %name, "killing orphan mux session");
                        if let Err(e) = inner.mux.kill_session(&name) {
                            warn!(mux_session = %name, "kill orphan: {e}");
                        }
                    }
                }
            }
            Err(e) => warn!("list mux sessions: {e}"),
        }
        mux::cleanup_stale_pipes(&kojo_core::settings::pipe_dir(), &known_running);

        save_sessions(inner).await;
        Ok(())
    }

    /// Reattach a restored record to its live mux session. Returns whether
    /// the session is now running.
    async fn resume_session(&self, session: &Arc<Session>, name: &str) -> bool {
        let inner = &self.inner;
        let prior_output = {
            let mut state = session.state.lock().unwrap();
            state.status = SessionStatus::Running;
            state.exit_code = None;
            state.done = CancellationToken::new();
            state.read_done = CancellationToken::new();
            state.last_output.take()
        };
        session.reset_detector();

        match reattach_mux(inner, session).await {
            Ok(child) => {
                // Seed scrollback with what the pane currently shows; the
                // pipe only carries output from this point on.
                if session.state.lock().unwrap().pipe_active {
                    match inner.mux.capture_pane_content(name) {
                        Ok(content) if !content.is_empty() => session.ingest(content.as_bytes()),
                        Ok(_) => {}
                        Err(e) => debug!(session = %session.id, "capture pane: {e}"),
                    }
                }
                tokio::spawn(mux_wait_loop(inner.clone(), session.clone(), child));
                info!(session = %session.id, "reattached running session");
                true
            }
            Err(e) => {
                warn!(session = %session.id, "reattach failed: {e}");
                let _ = inner.mux.kill_session(name);
                let done = {
                    let mut state = session.state.lock().unwrap();
                    state.status = SessionStatus::Exited;
                    state.exit_code = Some(1);
                    // Keep the tail we restored from disk over an empty ring.
                    state.last_output =
                        prior_output.or_else(|| Some(session.ring.tail(EXIT_TAIL_BYTES)));
                    state.done.clone()
                };
                done.cancel();
                false
            }
        }
    }

    /// Start a new session running `tool` in `work_dir`.
    pub async fn create(&self, req: CreateRequest) -> Result<Arc<Session>> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(KojoError::ShuttingDown);
        }

        let tool_path = tools::resolve_path(req.tool)?;
        if !req.work_dir.is_dir() {
            return Err(KojoError::InvalidWorkDir(req.work_dir.clone()));
        }

        let id = ids::generate_session_id();
        let mux_name = inner.mux.session_name(&id);

        let tool_session_id = if req.tool.preassigns_session_id() {
            Some(uuid::Uuid::new_v4().to_string())
        } else if req.tool.is_internal() {
            // The terminal tool's conversation id is its mux session name,
            // so a restart reattaches instead of starting over.
            Some(mux_name.clone())
        } else {
            None
        };

        let direct = req.tool.is_internal();
        let run_args = if direct {
            tools::terminal_args(&mux_name, &req.work_dir)
        } else {
            tools::launch_args(req.tool, &req.args, tool_session_id.as_deref())
        };

        info!(session = %id, tool = %req.tool, "creating session");

        let (attach, pipe) = if direct {
            let attach =
                mux::spawn_pty(&tool_path, &run_args, Some(&req.work_dir), req.cols, req.rows)?;
            (attach, None)
        } else {
            start_mux_attach(
                inner,
                &mux_name,
                &req.work_dir,
                &tool_path,
                &run_args,
                req.cols,
                req.rows,
            )?
        };

        let session = Arc::new(Session::new(
            id.clone(),
            req.tool,
            req.work_dir.clone(),
            req.args.clone(),
            req.yolo_mode,
            req.parent_id.clone(),
            req.tool.is_internal(),
            Utc::now(),
        ));
        session.state.lock().unwrap().tool_session_id = tool_session_id;

        // A concurrent Create may have won the race for the same child
        // slot; if so, ours is surplus and gets torn down again.
        {
            let mut sessions = inner.sessions.write().await;
            if let Some(parent_id) = &req.parent_id {
                let existing = sessions
                    .values()
                    .find(|s| {
                        s.parent_id.as_deref() == Some(parent_id.as_str())
                            && s.tool == req.tool
                            && s.is_running()
                    })
                    .cloned();
                if let Some(existing) = existing {
                    drop(sessions);
                    info!(session = %id, existing = %existing.id, "duplicate child; discarding ours");
                    discard_launch(inner, attach, pipe, (!direct).then_some(mux_name.as_str()));
                    return Ok(existing);
                }
            }
            sessions.insert(id.clone(), session.clone());
        }

        launch_epoch(
            inner,
            &session,
            attach,
            pipe,
            (!direct).then(|| mux_name.clone()),
            req.cols,
            req.rows,
            direct,
        );

        if direct {
            // The terminal tab forwards wheel events as mouse sequences;
            // turn mouse reporting on once the mux session exists.
            let mux = inner.mux;
            let name = mux_name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MOUSE_ENABLE_DELAY).await;
                if let Err(e) = mux.enable_mouse(&name) {
                    debug!(mux_session = %name, "enable mouse: {e}");
                }
            });
        }

        save_sessions(inner).await;
        Ok(session)
    }

    /// Relaunch an exited session, resuming the tool's conversation where
    /// possible. The stored args stay exactly as the user gave them.
    pub async fn restart(&self, id: &str) -> Result<Arc<Session>> {
        let inner = &self.inner;
        let session = self.get(id).await?;

        let (tool, args, tool_session_id, mux_name, cols, rows) = {
            let mut state = session.state.lock().unwrap();
            if state.status == SessionStatus::Running {
                return Err(KojoError::StillRunning(id.to_string()));
            }
            if state.restarting {
                return Err(KojoError::RestartInProgress(id.to_string()));
            }
            state.restarting = true;
            (
                session.tool,
                state.args.clone(),
                state.tool_session_id.clone(),
                state.mux_name.clone(),
                state.last_cols,
                state.last_rows,
            )
        };

        let result = restart_inner(
            inner,
            &session,
            tool,
            &args,
            tool_session_id.as_deref(),
            mux_name.as_deref(),
            cols,
            rows,
        )
        .await;
        if result.is_err() {
            session.state.lock().unwrap().restarting = false;
        }
        result?;

        save_sessions(inner).await;
        Ok(session)
    }

    /// Stop a running session: kill its mux session (SIGHUP to the child),
    /// stop its children, and terminate the attach process.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let session = self.get(id).await?;
        stop_session(&self.inner, &session).await
    }

    /// Shut the manager down. Direct-PTY sessions are stopped and awaited;
    /// mux-backed sessions are detached with their mux sessions left
    /// alive, which is what lets state survive a host restart.
    pub async fn stop_all(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        info!("stopping all sessions");

        let sessions: Vec<Arc<Session>> =
            inner.sessions.read().await.values().cloned().collect();

        let mut direct = Vec::new();
        let mut mux_backed = Vec::new();
        for session in sessions {
            if !session.is_running() {
                continue;
            }
            if session.mux_name().is_some() {
                mux_backed.push(session);
            } else {
                direct.push(session);
            }
        }

        for session in direct {
            let done = session.done();
            match stop_session(inner, &session).await {
                Ok(()) => {
                    if tokio::time::timeout(STOPALL_WAIT_TIMEOUT, done.cancelled())
                        .await
                        .is_err()
                    {
                        warn!(session = %session.id, "session did not exit in time");
                    }
                }
                Err(e) => warn!(session = %session.id, "stop: {e}"),
            }
        }

        for session in mux_backed {
            let (name, path, pid) = {
                let mut state = session.state.lock().unwrap();
                state.master = None;
                state.writer = None;
                state.pipe_active = false;
                (state.mux_name.clone(), state.raw_pipe_path.take(), state.child_pid)
            };
            if let Some(name) = &name {
                if let Some(path) = &path {
                    inner.mux.cleanup_pipe_pane(name, path);
                } else {
                    let _ = inner.mux.stop_pipe_pane(name);
                }
            }
            if let Some(pid) = pid {
                signal_process(pid, libc::SIGTERM);
                spawn_delayed_kill(pid);
            }
            info!(session = %session.id, "detached; mux session stays alive");
        }

        save_sessions(inner).await;
    }

    /// Persist the current session list.
    pub async fn save_all(&self) -> Result<()> {
        let records = collect_records(&self.inner).await;
        self.inner.store.save(&records)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| KojoError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut list: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// First running child with the given (parent, tool); otherwise any
    /// matching child.
    pub async fn find_child(&self, parent_id: &str, tool: ToolKind) -> Option<Arc<Session>> {
        let candidates: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.parent_id.as_deref() == Some(parent_id) && s.tool == tool)
                .cloned()
                .collect()
        };
        candidates
            .iter()
            .find(|s| s.is_running())
            .cloned()
            .or_else(|| candidates.first().cloned())
    }

    /// Run an allowlisted mux action against a session's pane.
    pub async fn run_action(&self, id: &str, action: &str) -> Result<()> {
        let action = MuxAction::parse(action)?;
        let session = self.get(id).await?;
        let target = {
            let state = session.state.lock().unwrap();
            state.mux_name.clone().or_else(|| state.tool_session_id.clone())
        }
        .ok_or_else(|| KojoError::Mux(format!("session {id} has no mux target")))?;
        self.inner.mux.run_action(&target, action)
    }
}

// ---------------------------------------------------------------------------
// Launch plumbing

#[allow(clippy::too_many_arguments)]
async fn restart_inner(
    inner: &Arc<Inner>,
    session: &Arc<Session>,
    tool: ToolKind,
    args: &[String],
    tool_session_id: Option<&str>,
    old_mux_name: Option<&str>,
    cols: u16,
    rows: u16,
) -> Result<()> {
    let tool_path = tools::resolve_path(tool)?;
    if !session.work_dir.is_dir() {
        return Err(KojoError::InvalidWorkDir(session.work_dir.clone()));
    }

    // Tear down whatever the previous epoch left behind.
    if let Some(name) = old_mux_name {
        let path = session.state.lock().unwrap().raw_pipe_path.take();
        if let Some(path) = path {
            inner.mux.cleanup_pipe_pane(name, &path);
        }
        if inner.mux.has_session(name) {
            let _ = inner.mux.kill_session(name);
        }
    }

    let run_args = tools::restart_args(tool, args, tool_session_id);
    info!(session = %session.id, tool = %tool, "restarting session");

    let direct = tool.is_internal();
    let (attach, pipe, mux_name) = if direct {
        let attach = mux::spawn_pty(&tool_path, &run_args, Some(&session.work_dir), cols, rows)?;
        (attach, None, None)
    } else {
        let name = old_mux_name
            .map(str::to_string)
            .unwrap_or_else(|| inner.mux.session_name(&session.id));
        let (attach, pipe) =
            start_mux_attach(inner, &name, &session.work_dir, &tool_path, &run_args, cols, rows)?;
        (attach, pipe, Some(name))
    };

    launch_epoch(inner, session, attach, pipe, mux_name, cols, rows, direct);
    Ok(())
}

/// Create the detached mux session, set up the raw-output pipe (best
/// effort), and spawn the attach process under a PTY. Partial failures
/// roll back what was already started.
fn start_mux_attach(
    inner: &Arc<Inner>,
    name: &str,
    work_dir: &Path,
    tool_path: &Path,
    args: &[String],
    cols: u16,
    rows: u16,
) -> Result<(AttachHandle, Option<RawPipe>)> {
    if let Err(e) = inner.mux.ensure_server_config() {
        debug!("mux server config: {e}");
    }

    let mut shell_cmd = ids::shell_quote(&tool_path.to_string_lossy());
    for arg in args {
        shell_cmd.push(' ');
        shell_cmd.push_str(&ids::shell_quote(arg));
    }

    inner.mux.new_session(name, work_dir, &shell_cmd, true)?;

    let pipe = match inner.mux.start_pipe_pane(name) {
        Ok(pipe) => Some(pipe),
        Err(e) => {
            warn!(mux_session = name, "pipe-pane setup failed, reading attach pty: {e}");
            None
        }
    };

    match inner.mux.spawn_attach(name, cols, rows) {
        Ok(attach) => Ok((attach, pipe)),
        Err(e) => {
            if let Some(pipe) = &pipe {
                inner.mux.cleanup_pipe_pane(name, &pipe.path);
            }
            let _ = inner.mux.kill_session(name);
            Err(e)
        }
    }
}

/// Install a fresh epoch on the record and start its loops.
#[allow(clippy::too_many_arguments)]
fn launch_epoch(
    inner: &Arc<Inner>,
    session: &Arc<Session>,
    attach: AttachHandle,
    pipe: Option<RawPipe>,
    mux_name: Option<String>,
    cols: u16,
    rows: u16,
    direct: bool,
) {
    let AttachHandle {
        master,
        writer,
        child,
    } = attach;
    let child_pid = child.process_id();

    session.reset_detector();
    let (done, read_done) = {
        let mut state = session.state.lock().unwrap();
        state.child_pid = child_pid;
        state.pipe_active = pipe.is_some();
        state.raw_pipe_path = pipe.as_ref().map(|p| p.path.clone());
        if mux_name.is_some() {
            state.mux_name = mux_name;
        }
        state.status = SessionStatus::Running;
        state.exit_code = None;
        state.last_output = None;
        state.restarting = false;
        state.last_cols = if cols == 0 { mux::DEFAULT_COLS } else { cols };
        state.last_rows = if rows == 0 { mux::DEFAULT_ROWS } else { rows };
        state.done = CancellationToken::new();
        state.read_done = CancellationToken::new();
        (state.done.clone(), state.read_done.clone())
    };

    match pipe {
        Some(pipe) => {
            spawn_drain_thread(session, master.as_ref());
            tokio::spawn(read_loop(
                inner.clone(),
                session.clone(),
                OutputSource::Pipe(pipe.rx),
                done,
                read_done,
            ));
        }
        None => match spawn_pty_reader(master.as_ref()) {
            Ok(rx) => {
                tokio::spawn(read_loop(
                    inner.clone(),
                    session.clone(),
                    OutputSource::Pty(rx),
                    done,
                    read_done,
                ));
            }
            Err(e) => {
                warn!(session = %session.id, "pty reader: {e}");
                read_done.cancel();
            }
        },
    }

    {
        let mut state = session.state.lock().unwrap();
        state.master = Some(master);
        state.writer = Some(writer);
    }

    if direct {
        tokio::spawn(wait_loop(inner.clone(), session.clone(), child));
    } else {
        tokio::spawn(mux_wait_loop(inner.clone(), session.clone(), child));
    }
}

/// Undo a launch that lost the duplicate race.
fn discard_launch(
    inner: &Arc<Inner>,
    attach: AttachHandle,
    pipe: Option<RawPipe>,
    mux_name: Option<&str>,
) {
    if let Some(pid) = attach.child.process_id() {
        signal_process(pid, libc::SIGKILL);
    }
    drop(attach);
    if let Some(name) = mux_name {
        if let Some(pipe) = pipe {
            inner.mux.cleanup_pipe_pane(name, &pipe.path);
        }
        let _ = inner.mux.kill_session(name);
    }
}

/// Reattach to a live mux session after the attach process died (or at
/// startup). An already-running pipe read loop is left alone; a dead or
/// missing one is recreated, falling back to PTY reads if pipe-pane is
/// unavailable.
async fn reattach_mux(
    inner: &Arc<Inner>,
    session: &Arc<Session>,
) -> Result<Box<dyn portable_pty::Child + Send + Sync>> {
    let name = session
        .mux_name()
        .ok_or_else(|| KojoError::Mux("session has no mux name".to_string()))?;

    if let Err(e) = inner.mux.ensure_server_config() {
        debug!("mux server config: {e}");
    }

    let (pipe_was_active, old_read_done, done, cols, rows) = {
        let state = session.state.lock().unwrap();
        (
            state.pipe_active,
            state.read_done.clone(),
            state.done.clone(),
            state.last_cols,
            state.last_rows,
        )
    };
    let reader_alive = pipe_was_active && !old_read_done.is_cancelled();

    let mut new_pipe = None;
    if !reader_alive {
        if pipe_was_active {
            // The loop we thought was consuming the FIFO is gone; clear
            // the stale pipe before starting a fresh one.
            let path = {
                let mut state = session.state.lock().unwrap();
                state.pipe_active = false;
                state.raw_pipe_path.take()
            };
            if let Some(path) = path {
                inner.mux.cleanup_pipe_pane(&name, &path);
            }
        }
        match inner.mux.start_pipe_pane(&name) {
            Ok(pipe) => new_pipe = Some(pipe),
            Err(e) => {
                warn!(session = %session.id, "pipe-pane unavailable, reading attach pty: {e}")
            }
        }
    }

    let attach = match inner.mux.spawn_attach(&name, cols, rows) {
        Ok(attach) => attach,
        Err(e) => {
            if let Some(pipe) = new_pipe {
                inner.mux.cleanup_pipe_pane(&name, &pipe.path);
            }
            return Err(e);
        }
    };
    let pid = attach.child.process_id();

    if let Some(pipe) = new_pipe {
        let read_done = {
            let mut state = session.state.lock().unwrap();
            state.pipe_active = true;
            state.raw_pipe_path = Some(pipe.path.clone());
            state.read_done = CancellationToken::new();
            state.read_done.clone()
        };
        tokio::spawn(read_loop(
            inner.clone(),
            session.clone(),
            OutputSource::Pipe(pipe.rx),
            done.clone(),
            read_done,
        ));
    }

    let pipe_active = session.state.lock().unwrap().pipe_active;
    if pipe_active {
        // The attach PTY still has to be drained or the mux blocks on an
        // unread client.
        spawn_drain_thread(session, attach.master.as_ref());
    } else {
        let rx = spawn_pty_reader(attach.master.as_ref())?;
        let read_done = {
            let mut state = session.state.lock().unwrap();
            state.read_done = CancellationToken::new();
            state.read_done.clone()
        };
        tokio::spawn(read_loop(
            inner.clone(),
            session.clone(),
            OutputSource::Pty(rx),
            done,
            read_done,
        ));
    }

    {
        let mut state = session.state.lock().unwrap();
        state.master = Some(attach.master);
        state.writer = Some(attach.writer);
        state.child_pid = pid;
    }

    Ok(attach.child)
}

// ---------------------------------------------------------------------------
// Loops

enum OutputSource {
    Pipe(pipe::Receiver),
    Pty(tokio::sync::mpsc::Receiver<Bytes>),
}

async fn next_chunk(source: &mut OutputSource, buf: &mut [u8]) -> Option<Bytes> {
    use tokio::io::AsyncReadExt;
    match source {
        OutputSource::Pipe(rx) => match rx.read(buf).await {
            Ok(0) => None,
            Ok(n) => Some(Bytes::copy_from_slice(&buf[..n])),
            Err(_) => None,
        },
        OutputSource::Pty(rx) => rx.recv().await,
    }
}

/// Consume session output: scrollback, fan-out, tool id capture, prompt
/// detection. Runs until the source ends or the epoch terminates.
async fn read_loop(
    inner: Arc<Inner>,
    session: Arc<Session>,
    mut source: OutputSource,
    done: CancellationToken,
    read_done: CancellationToken,
) {
    let mut buf = vec![0u8; READER_CHUNK];
    loop {
        let chunk = tokio::select! {
            _ = done.cancelled() => None,
            chunk = next_chunk(&mut source, &mut buf) => chunk,
        };
        let Some(data) = chunk else { break };

        session.ingest(&data);

        if session.tool.prints_session_id() {
            if let Some(id) = session.capture_tool_session_id(&data) {
                debug!(session = %session.id, tool_session_id = %id, "captured tool session id");
                save_sessions(&inner).await;
            }
        }

        if session.check_yolo(&data).is_some() {
            debug!(session = %session.id, "approval prompt detected");
            let session = session.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::time::sleep(YOLO_REPLY_DELAY).await;
                // The mode can be disarmed between detection and reply.
                if session.is_yolo_mode() && !done.is_cancelled() {
                    if let Err(e) = session.write(b"\r").await {
                        debug!(session = %session.id, "auto-approve write: {e}");
                    }
                }
            });
        }
    }
    read_done.cancel();
}

/// Bridge the blocking PTY reader onto a channel the async loops can
/// select on. The thread ends when the PTY closes.
fn spawn_pty_reader(
    master: &(dyn portable_pty::MasterPty + Send),
) -> Result<tokio::sync::mpsc::Receiver<Bytes>> {
    let mut reader = master
        .try_clone_reader()
        .map_err(|e| KojoError::Pty(e.to_string()))?;
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    std::thread::spawn(move || {
        let mut buf = [0u8; READER_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    Ok(rx)
}

/// Read and discard attach PTY output while the raw pipe carries the real
/// stream, so the mux never back-pressures on an unread client.
fn spawn_drain_thread(session: &Session, master: &(dyn portable_pty::MasterPty + Send)) {
    match master.try_clone_reader() {
        Ok(mut reader) => {
            std::thread::spawn(move || {
                let mut buf = [0u8; READER_CHUNK];
                while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
            });
        }
        Err(e) => warn!(session = %session.id, "drain reader: {e}"),
    }
}

/// Direct-PTY sessions: wait for the child, close the PTY, drain the
/// reader, finalize.
async fn wait_loop(
    inner: Arc<Inner>,
    session: Arc<Session>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
) {
    let status = tokio::task::spawn_blocking(move || {
        let mut child = child;
        child.wait()
    })
    .await;
    let exit_code = match status {
        Ok(Ok(status)) => status.exit_code() as i32,
        Ok(Err(e)) => {
            warn!(session = %session.id, "child wait: {e}");
            1
        }
        Err(e) => {
            warn!(session = %session.id, "wait task: {e}");
            1
        }
    };

    {
        let mut state = session.state.lock().unwrap();
        state.master = None;
        state.writer = None;
    }
    let read_done = session.read_done();
    if tokio::time::timeout(READ_DRAIN_TIMEOUT, read_done.cancelled())
        .await
        .is_err()
    {
        warn!(session = %session.id, "read loop did not finish after exit");
    }

    complete_exit(&inner, &session, exit_code).await;
}

/// Mux-backed sessions: reap the attach process and poll the pane, looping
/// through reattach cycles until the pane actually dies.
async fn mux_wait_loop(
    inner: Arc<Inner>,
    session: Arc<Session>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
) {
    let Some(name) = session.mux_name() else {
        warn!(session = %session.id, "mux wait loop without a mux session");
        return;
    };
    let mut child = child;

    'attach: loop {
        let pid = child.process_id();
        session.state.lock().unwrap().child_pid = pid;
        let mut wait_task = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        });
        let mut ticker = tokio::time::interval(PANE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut pane_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut wait_task => {
                    if inner.shutting_down.load(Ordering::SeqCst) {
                        // StopAll detached us on purpose; the mux session
                        // lives on for the next manager.
                        return;
                    }

                    // Close only the attach PTY. A pipe read loop keeps
                    // consuming the FIFO across the reattach.
                    let pipe_active = {
                        let mut state = session.state.lock().unwrap();
                        state.master = None;
                        state.writer = None;
                        state.pipe_active
                    };
                    let read_done = session.read_done();
                    if !pipe_active {
                        if tokio::time::timeout(READ_DRAIN_TIMEOUT, read_done.cancelled())
                            .await
                            .is_err()
                        {
                            warn!(session = %session.id, "attach reader did not finish");
                        }
                    } else if read_done.is_cancelled() {
                        // The pipe reader died while the attach was going
                        // down; clean up and carry on as if it never ran.
                        let path = {
                            let mut state = session.state.lock().unwrap();
                            state.pipe_active = false;
                            state.raw_pipe_path.take()
                        };
                        if let Some(path) = path {
                            inner.mux.cleanup_pipe_pane(&name, &path);
                        }
                    }

                    if !inner.mux.has_session(&name) {
                        complete_exit(&inner, &session, 1).await;
                        return;
                    }
                    match inner.mux.pane_dead(&name) {
                        Ok((false, _)) => match reattach_mux(&inner, &session).await {
                            Ok(new_child) => {
                                debug!(session = %session.id, "reattached after attach exit");
                                child = new_child;
                                continue 'attach;
                            }
                            Err(e) => {
                                warn!(session = %session.id, "reattach failed: {e}");
                                let _ = inner.mux.kill_session(&name);
                                complete_exit(&inner, &session, 1).await;
                                return;
                            }
                        },
                        Ok((true, code)) => {
                            let _ = inner.mux.kill_session(&name);
                            complete_exit(&inner, &session, code).await;
                            return;
                        }
                        Err(e) => {
                            warn!(session = %session.id, "pane state after attach exit: {e}");
                            let _ = inner.mux.kill_session(&name);
                            complete_exit(&inner, &session, 1).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if inner.shutting_down.load(Ordering::SeqCst) {
                        continue;
                    }
                    if !inner.mux.has_session(&name) {
                        debug!(session = %session.id, "mux session vanished");
                        terminate_attach(&session);
                        complete_exit(&inner, &session, 1).await;
                        return;
                    }
                    match inner.mux.pane_dead(&name) {
                        Ok((true, code)) => {
                            let _ = inner.mux.kill_session(&name);
                            terminate_attach(&session);
                            complete_exit(&inner, &session, code).await;
                            return;
                        }
                        Ok((false, _)) => {
                            pane_errors = 0;
                            // A live pane with a dead pipe reader means we
                            // lost the stream; kill the attach to force a
                            // reattach cycle that recreates the pipe.
                            let (pipe_active, read_done) = {
                                let state = session.state.lock().unwrap();
                                (state.pipe_active, state.read_done.clone())
                            };
                            if pipe_active && read_done.is_cancelled() {
                                warn!(session = %session.id, "pipe reader died; forcing reattach");
                                terminate_attach(&session);
                            }
                        }
                        Err(e) => {
                            pane_errors += 1;
                            debug!(session = %session.id, errors = pane_errors, "pane state query failed: {e}");
                            if pane_errors >= PANE_ERROR_LIMIT {
                                error!(session = %session.id, "pane state unavailable; treating session as gone");
                                let _ = inner.mux.kill_session(&name);
                                terminate_attach(&session);
                                complete_exit(&inner, &session, 1).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Teardown

/// Finalize the current epoch: capture the scrollback tail, flip the
/// status, close `done`, persist, stop children, fire the exit hook.
/// Idempotent per epoch.
async fn complete_exit(inner: &Arc<Inner>, session: &Arc<Session>, exit_code: i32) {
    let done = {
        let mut state = session.state.lock().unwrap();
        if state.status == SessionStatus::Exited {
            return;
        }
        state.status = SessionStatus::Exited;
        state.exit_code = Some(exit_code);
        if state.last_output.is_none() {
            state.last_output = Some(session.ring.tail(EXIT_TAIL_BYTES));
        }
        state.master = None;
        state.writer = None;
        state.done.clone()
    };
    done.cancel();
    info!(session = %session.id, exit_code, "session exited");

    // Give the read loop a moment to drain before tearing down the pipe.
    let read_done = session.read_done();
    if tokio::time::timeout(READ_DRAIN_TIMEOUT, read_done.cancelled())
        .await
        .is_err()
    {
        warn!(session = %session.id, "read loop still running after exit");
    }

    let (name, path) = {
        let mut state = session.state.lock().unwrap();
        state.pipe_active = false;
        (state.mux_name.clone(), state.raw_pipe_path.take())
    };
    if let (Some(name), Some(path)) = (name, path) {
        inner.mux.cleanup_pipe_pane(&name, &path);
    }

    save_sessions(inner).await;

    // Children shadowing this session go down with it, best effort.
    let children: Vec<Arc<Session>> = {
        let sessions = inner.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(session.id.as_str()))
            .cloned()
            .collect()
    };
    for child in children {
        if child.is_running() {
            if let Err(e) = stop_session(inner, &child).await {
                debug!(child = %child.id, "stop child: {e}");
            }
        }
    }

    let hook = inner.on_exit.lock().unwrap();
    if let Some(hook) = hook.as_ref() {
        hook(session.clone());
    }
}

async fn stop_session(inner: &Arc<Inner>, session: &Arc<Session>) -> Result<()> {
    let (mux_name, pid) = {
        let state = session.state.lock().unwrap();
        if state.restarting {
            return Err(KojoError::RestartInProgress(session.id.clone()));
        }
        if state.status != SessionStatus::Running {
            return Err(KojoError::NotRunning(session.id.clone()));
        }
        (state.mux_name.clone(), state.child_pid)
    };
    info!(session = %session.id, "stopping session");

    // Killing the mux session delivers SIGHUP to the child.
    if let Some(name) = &mux_name {
        if let Err(e) = inner.mux.kill_session(name) {
            debug!(session = %session.id, "kill mux session: {e}");
        }
    }

    let children: Vec<Arc<Session>> = {
        let sessions = inner.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(session.id.as_str()))
            .cloned()
            .collect()
    };
    for child in children {
        if child.is_running() {
            if let Err(e) = Box::pin(stop_session(inner, &child)).await {
                debug!(child = %child.id, "stop child: {e}");
            }
        }
    }

    if let Some(pid) = pid {
        signal_process(pid, libc::SIGTERM);
        spawn_delayed_kill(pid);
    }
    Ok(())
}

fn terminate_attach(session: &Session) {
    if let Some(pid) = session.state.lock().unwrap().child_pid {
        signal_process(pid, libc::SIGTERM);
        spawn_delayed_kill(pid);
    }
}

fn signal_process(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn spawn_delayed_kill(pid: u32) {
    tokio::spawn(async move {
        tokio::time::sleep(STOP_KILL_TIMEOUT).await;
        if process_alive(pid) {
            warn!(pid, "process ignored SIGTERM; sending SIGKILL");
            signal_process(pid, libc::SIGKILL);
        }
    });
}

// ---------------------------------------------------------------------------
// Persistence

async fn collect_records(inner: &Arc<Inner>) -> Vec<PersistedSession> {
    let sessions: Vec<Arc<Session>> = inner.sessions.read().await.values().cloned().collect();
    let mut records: Vec<PersistedSession> =
        sessions.iter().map(|s| s.persist_record()).collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    records
}

async fn save_sessions(inner: &Arc<Inner>) {
    let records = collect_records(inner).await;
    if let Err(e) = inner.store.save(&records) {
        warn!("persist sessions: {e}");
    }
}
