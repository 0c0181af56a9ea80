//! Session runtime: one accepted SSH channel running one child process.
//!
//! Each session owns a stdin pump, an output pump per stream, and a
//! termination watcher. A single exit gate decides the race between the
//! child exiting on its own and the session context being cancelled
//! (client disconnect, session timeout, policy revocation, shutdown), so
//! the child is killed at most once and the exit status reaches the
//! client exactly once.

pub mod recording;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env as envknob;
use crate::conn::ConnShared;
use crate::localuser::{process_euid, LocalAccount};
use crate::policy::SshAction;
use crate::server::SshServer;
use crate::session::recording::{Recording, DIR_INPUT, DIR_OUTPUT};
use crate::utils::generate_shared_id;

/// What the channel asked the session to run.
#[derive(Debug, Clone)]
pub enum SessionKind {
    Shell,
    Exec(String),
    Sftp,
}

impl SessionKind {
    pub fn is_sftp(&self) -> bool {
        matches!(self, SessionKind::Sftp)
    }
}

/// PTY parameters captured from the channel's pty-request.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Why a session was terminated early. The user message, when present, is
/// written to the session's stderr wrapped in blank lines.
#[derive(Debug, Clone)]
pub struct TerminationCause {
    pub reason: String,
    pub user_message: Option<String>,
}

impl TerminationCause {
    pub fn revoked() -> Self {
        Self {
            reason: "policy revoked".into(),
            user_message: Some("Access revoked.".into()),
        }
    }

    pub fn timeout(secs: u64) -> Self {
        Self {
            reason: "session timeout".into(),
            user_message: Some(format!("Session timeout of {secs}s elapsed.")),
        }
    }

    pub fn done() -> Self {
        Self {
            reason: "session done".into(),
            user_message: None,
        }
    }
}

/// Cancellation context for one session. `close_with` is idempotent: only
/// the first cause wins, later calls are no-ops.
pub struct SessionCtx {
    cancel: CancellationToken,
    closed: AtomicBool,
    cause: StdMutex<Option<TerminationCause>>,
}

impl SessionCtx {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            closed: AtomicBool::new(false),
            cause: StdMutex::new(None),
        }
    }

    pub fn close_with(&self, cause: TerminationCause) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.cause.lock().expect("session cause lock poisoned") = Some(cause);
        }
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause
            .lock()
            .expect("session cause lock poisoned")
            .clone()
    }
}

enum InputEvent {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Eof,
}

/// Handle to a running session, kept by the connection's channel table and
/// by the connection's session list (for revocation and shutdown).
pub struct SshSession {
    pub shared_id: String,
    pub ctx: Arc<SessionCtx>,
    input_tx: mpsc::UnboundedSender<InputEvent>,
}

impl SshSession {
    /// Feed client data toward the child's stdin. Never blocks; data is
    /// recorded and written by the stdin pump.
    pub fn write_input(&self, data: &[u8]) {
        let _ = self.input_tx.send(InputEvent::Data(data.to_vec()));
    }

    /// Client sent EOF: the child's stdin is closed once buffered input
    /// has drained.
    pub fn input_eof(&self) {
        let _ = self.input_tx.send(InputEvent::Eof);
    }

    pub fn resize(&self, cols: u32, rows: u32) {
        let _ = self.input_tx.send(InputEvent::Resize { cols, rows });
    }
}

/// Everything needed to launch a session on an accepted channel.
pub struct SessionParams {
    pub srv: Arc<SshServer>,
    pub conn: Arc<ConnShared>,
    pub channel_id: ChannelId,
    pub handle: Handle,
    pub kind: SessionKind,
    pub pty: Option<PtyRequest>,
    pub env: HashMap<String, String>,
    pub agent_requested: bool,
    pub final_action: SshAction,
    pub account: Arc<LocalAccount>,
}

/// Spawn the session runtime. Returns the session handle immediately; the
/// runtime itself runs on the server's session tracker so `Shutdown` can
/// wait for it.
pub fn spawn_session(params: SessionParams) -> Arc<SshSession> {
    let shared_id = generate_shared_id("sess", params.srv.now());
    let ctx = Arc::new(SessionCtx::new(params.conn.cancel.child_token()));
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let sess = Arc::new(SshSession {
        shared_id: shared_id.clone(),
        ctx,
        input_tx,
    });
    info!(conn_id = %params.conn.conn_id, session = %shared_id, "starting session");

    let runner = SessionRunner {
        sess: sess.clone(),
        params,
        input_rx: Some(input_rx),
        exit_claimed: AtomicBool::new(false),
    };
    let srv = runner.params.srv.clone();
    let tracked = srv.track_session(runner.run());
    tokio::spawn(tracked);
    sess
}

/// Write `msg` to the channel's stderr, then report `code` and close the
/// channel. Used for session setup failures.
pub async fn write_stderr_and_exit(handle: &Handle, channel: ChannelId, msg: &str, code: u32) {
    let _ = handle
        .extended_data(channel, 1, CryptoVec::from_slice(msg.as_bytes()))
        .await;
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

fn vlog_enabled() -> bool {
    envknob::debug_ssh_vlog()
}

struct SessionRunner {
    sess: Arc<SshSession>,
    params: SessionParams,
    input_rx: Option<mpsc::UnboundedReceiver<InputEvent>>,
    /// The kill-vs-natural-exit gate: whoever claims it first decides how
    /// the child ends.
    exit_claimed: AtomicBool,
}

enum InputSink {
    Pty(pty_process::OwnedWritePty),
    Pipe(tokio::process::ChildStdin),
}

enum Child {
    Pty(tokio::process::Child),
    Piped(tokio::process::Child),
}

impl Child {
    async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        match self {
            Child::Pty(c) => c.wait().await,
            Child::Piped(c) => c.wait().await,
        }
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        match self {
            Child::Pty(c) => c.start_kill(),
            Child::Piped(c) => c.start_kill(),
        }
    }
}

struct AgentForward {
    sock_path: PathBuf,
    dir: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl SessionRunner {
    async fn run(mut self) {
        let metrics = self.params.srv.metrics.clone();
        metrics.active_sessions.inc();

        if !self
            .params
            .srv
            .attach_session(&self.params.conn, &self.sess)
        {
            write_stderr_and_exit(
                &self.params.handle,
                self.params.channel_id,
                "meshssh is shutting down\r\n",
                1,
            )
            .await;
            metrics.active_sessions.dec();
            return;
        }

        let result = self.session_body().await;
        if let Err(e) = result {
            warn!(session = %self.sess.shared_id, error = %e, "session failed");
        }

        self.params
            .srv
            .detach_session(&self.params.conn, &self.sess);
        self.sess.ctx.close_with(TerminationCause::done());
        metrics.active_sessions.dec();
    }

    fn claim_exit(&self) -> bool {
        !self.exit_claimed.swap(true, Ordering::SeqCst)
    }

    async fn session_body(&mut self) -> Result<()> {
        let handle = self.params.handle.clone();
        let channel_id = self.params.channel_id;
        let account = self.params.account.clone();
        let ctx = self.sess.ctx.clone();

        // Session deadline from the final action, if any.
        let _timeout_guard = if self.params.final_action.session_duration > 0 {
            let secs = self.params.final_action.session_duration;
            let ctx = ctx.clone();
            Some(AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                ctx.close_with(TerminationCause::timeout(secs));
            })))
        } else {
            None
        };

        let euid = process_euid();
        if euid != 0 && euid != account.uid {
            warn!(
                session = %self.sess.shared_id,
                target = %account.username,
                euid = euid,
                "cannot switch user from non-root process"
            );
            write_stderr_and_exit(&handle, channel_id, "can't switch user\r\n", 1).await;
            return Ok(());
        }

        let mut agent: Option<AgentForward> = None;
        let mut recorder: Option<Arc<Recording>> = None;

        if !self.params.kind.is_sftp() {
            if self.params.agent_requested && self.params.final_action.allow_agent_forwarding {
                match setup_agent_forwarding(
                    &self.sess.shared_id,
                    &account,
                    handle.clone(),
                    ctx.clone(),
                )
                .await
                {
                    Ok(fwd) => agent = Some(fwd),
                    Err(e) => {
                        warn!(session = %self.sess.shared_id, error = %e, "agent forwarding failed");
                    }
                }
            }

            if self.params.pty.is_some() && envknob::debug_log_ssh() {
                match self.start_recording() {
                    Ok(rec) => recorder = Some(Arc::new(rec)),
                    Err(e) => {
                        warn!(session = %self.sess.shared_id, error = %e, "can't start recording");
                        write_stderr_and_exit(&handle, channel_id, "can't start new recording\r\n", 1)
                            .await;
                        return Ok(());
                    }
                }
            }
        }

        let env = self.child_env(agent.as_ref());
        let launched = self.launch_process(&account, euid, &env);
        let (mut child, sink, stdout, stderr) = match launched {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session = %self.sess.shared_id, error = %e, "start failed");
                write_stderr_and_exit(&handle, channel_id, "failed to start process\r\n", 1).await;
                return Ok(());
            }
        };

        // Output streams still open: 1 for a PTY, 2 for pipes.
        let open_streams = Arc::new(AtomicI32::new(if stderr.is_some() { 2 } else { 1 }));

        let stdin_pump = self.spawn_stdin_pump(sink, recorder.clone());
        let stdout_pump = self.spawn_output_pump(
            stdout,
            OutputStream::Stdout,
            recorder.clone(),
            open_streams.clone(),
        );
        let stderr_pump = stderr.map(|err_reader| {
            self.spawn_output_pump(
                Box::new(err_reader) as Box<dyn AsyncRead + Send + Unpin>,
                OutputStream::Stderr,
                None,
                open_streams.clone(),
            )
        });

        // The kill-vs-wait race: the primary path always runs the final
        // wait, the cancellation path only ever issues the kill.
        let status = tokio::select! {
            status = child.wait() => {
                self.claim_exit();
                status
            }
            _ = ctx.cancelled() => {
                if self.claim_exit() {
                    if let Some(cause) = ctx.cause() {
                        info!(session = %self.sess.shared_id, reason = %cause.reason, "terminating session");
                        if let Some(msg) = cause.user_message {
                            let framed = format!("\r\n\r\n{msg}\r\n\r\n");
                            let _ = handle
                                .extended_data(channel_id, 1, CryptoVec::from_slice(framed.as_bytes()))
                                .await;
                        }
                    }
                    if let Err(e) = child.start_kill() {
                        warn!(session = %self.sess.shared_id, error = %e, "kill failed");
                    }
                }
                child.wait().await
            }
        };

        // Let the output pumps drain what the child left behind.
        let _ = tokio::time::timeout(Duration::from_secs(5), stdout_pump).await;
        if let Some(pump) = stderr_pump {
            let _ = tokio::time::timeout(Duration::from_secs(5), pump).await;
        }
        stdin_pump.abort();

        let code = match status {
            Ok(st) => st.code().unwrap_or(1) as u32,
            Err(e) => {
                warn!(session = %self.sess.shared_id, error = %e, "wait failed");
                1
            }
        };
        if vlog_enabled() {
            debug!(session = %self.sess.shared_id, code = code, "child exited");
        }

        // The output pumps already sent EOF when the last stream drained.
        let _ = handle.exit_status_request(channel_id, code).await;
        let _ = handle.close(channel_id).await;

        if let Some(fwd) = agent {
            fwd.task.abort();
            let _ = std::fs::remove_file(&fwd.sock_path);
            let _ = std::fs::remove_dir(&fwd.dir);
        }

        info!(session = %self.sess.shared_id, code = code, "session complete");
        Ok(())
    }

    fn start_recording(&self) -> Result<Recording> {
        let var_root = self
            .params
            .srv
            .backend()
            .var_root()
            .context("no var root for recording storage")?;
        let pty = self
            .params
            .pty
            .as_ref()
            .context("recording requires a PTY")?;
        let term = if pty.term.is_empty() {
            "xterm-256color"
        } else {
            &pty.term
        };
        let rec = Recording::create(&var_root.join("ssh-sessions"), pty.cols, pty.rows, term)?;
        info!(session = %self.sess.shared_id, path = %rec.path().display(), "recording session");
        Ok(rec)
    }

    fn child_env(&self, agent: Option<&AgentForward>) -> Vec<(String, String)> {
        let account = &self.params.account;
        let term = self
            .params
            .pty
            .as_ref()
            .map(|p| p.term.clone())
            .filter(|t| !t.is_empty())
            .or_else(|| self.params.env.get("TERM").cloned())
            .unwrap_or_else(|| "xterm-256color".to_string());

        let mut env = vec![
            ("HOME".to_string(), account.home.display().to_string()),
            ("USER".to_string(), account.username.clone()),
            ("LOGNAME".to_string(), account.username.clone()),
            ("SHELL".to_string(), account.shell.display().to_string()),
            (
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
            ),
            ("TERM".to_string(), term),
        ];
        if let Some(lang) = self.params.env.get("LANG") {
            env.push(("LANG".to_string(), lang.clone()));
        }
        if let Some(fwd) = agent {
            env.push((
                "SSH_AUTH_SOCK".to_string(),
                fwd.sock_path.display().to_string(),
            ));
        }
        env
    }

    /// Spawn the child for this session. Returns the child, the stdin
    /// sink, the stdout reader, and the stderr reader (pipes only).
    #[allow(clippy::type_complexity)]
    fn launch_process(
        &mut self,
        account: &LocalAccount,
        euid: u32,
        env: &[(String, String)],
    ) -> Result<(
        Child,
        InputSink,
        Box<dyn AsyncRead + Send + Unpin>,
        Option<tokio::process::ChildStderr>,
    )> {
        let cwd = if account.home.is_dir() {
            account.home.clone()
        } else {
            PathBuf::from("/")
        };

        // SFTP always runs over pipes, even if the client asked for a PTY.
        let pty_params = if self.params.kind.is_sftp() {
            None
        } else {
            self.params.pty.clone()
        };
        if let Some(pty_req) = pty_params {
            let pty = pty_process::Pty::new().context("allocating PTY")?;
            let pts = pty.pts().context("opening PTY follower")?;

            let mut cmd = pty_process::Command::new(&account.shell);
            if let SessionKind::Exec(command) = &self.params.kind {
                cmd.arg("-c").arg(command);
            }
            cmd.env_clear().envs(env.iter().cloned()).current_dir(&cwd);
            if euid == 0 {
                cmd.uid(account.uid)
                    .gid(account.gid)
                    .groups(&account.group_ids);
            }
            let child = cmd.spawn(&pts).context("spawning PTY child")?;

            let (read_half, write_half) = pty.into_split();
            if let Err(e) = write_half.resize(pty_process::Size::new(
                pty_req.rows as u16,
                pty_req.cols as u16,
            )) {
                warn!(session = %self.sess.shared_id, error = %e, "pty resize failed");
            }
            return Ok((
                Child::Pty(child),
                InputSink::Pty(write_half),
                Box::new(read_half),
                None,
            ));
        }

        let (program, args): (PathBuf, Vec<String>) = match &self.params.kind {
            SessionKind::Shell => (account.shell.clone(), Vec::new()),
            SessionKind::Exec(command) => (
                account.shell.clone(),
                vec!["-c".to_string(), command.clone()],
            ),
            SessionKind::Sftp => (self.params.srv.sftp_server_path().to_path_buf(), Vec::new()),
        };

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .env_clear()
            .envs(env.iter().cloned())
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if euid == 0 {
            cmd.uid(account.uid)
                .gid(account.gid)
                .groups(&account.group_ids);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))?;

        let stdin = child.stdin.take().context("child stdin missing")?;
        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        Ok((
            Child::Piped(child),
            InputSink::Pipe(stdin),
            Box::new(stdout),
            Some(stderr),
        ))
    }

    fn spawn_stdin_pump(
        &mut self,
        mut sink: InputSink,
        recorder: Option<Arc<Recording>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = self.input_rx.take().expect("stdin pump started twice");
        let ctx = self.sess.ctx.clone();
        let shared_id = self.sess.shared_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    InputEvent::Data(data) => {
                        if let Some(rec) = &recorder {
                            rec.record(DIR_INPUT, &data);
                        }
                        let res = match &mut sink {
                            InputSink::Pty(w) => w.write_all(&data).await,
                            InputSink::Pipe(w) => w.write_all(&data).await,
                        };
                        if let Err(e) = res {
                            debug!(session = %shared_id, error = %e, "stdin copy ended");
                            ctx.close_with(TerminationCause {
                                reason: format!("stdin copy: {e}"),
                                user_message: None,
                            });
                            break;
                        }
                    }
                    InputEvent::Resize { cols, rows } => {
                        if let InputSink::Pty(w) = &sink {
                            let _ = w.resize(pty_process::Size::new(rows as u16, cols as u16));
                        }
                    }
                    InputEvent::Eof => break,
                }
            }
            // Dropping the sink closes the child's stdin.
        })
    }

    fn spawn_output_pump(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        stream: OutputStream,
        recorder: Option<Arc<Recording>>,
        open_streams: Arc<AtomicI32>,
    ) -> tokio::task::JoinHandle<()> {
        let handle = self.params.handle.clone();
        let channel_id = self.params.channel_id;
        let shared_id = self.sess.shared_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                // A PTY read error after the child exits is the normal EOF.
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Some(rec) = &recorder {
                    rec.record(DIR_OUTPUT, &buf[..n]);
                }
                let sent = match stream {
                    OutputStream::Stdout => {
                        handle.data(channel_id, CryptoVec::from_slice(&buf[..n])).await
                    }
                    OutputStream::Stderr => {
                        handle
                            .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                            .await
                    }
                };
                if sent.is_err() {
                    debug!(session = %shared_id, "client write failed; stopping output pump");
                    break;
                }
            }
            if open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _ = handle.eof(channel_id).await;
            }
        })
    }
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Abort a helper task when the guard leaves scope.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Create the per-session agent socket: a Unix socket only the target user
/// can use, in a directory the user can traverse, proxied onto agent
/// channels opened back to the client.
async fn setup_agent_forwarding(
    shared_id: &str,
    account: &LocalAccount,
    handle: Handle,
    ctx: Arc<SessionCtx>,
) -> Result<AgentForward> {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("meshssh-agent-{shared_id}"));
    std::fs::create_dir(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let sock_path = dir.join("agent.sock");

    let listener = UnixListener::bind(&sock_path)
        .with_context(|| format!("binding {}", sock_path.display()))?;

    std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600))
        .context("setting agent socket mode")?;
    nix::unistd::chown(
        &sock_path,
        Some(nix::unistd::Uid::from_raw(account.uid)),
        Some(nix::unistd::Gid::from_raw(account.gid)),
    )
    .context("chowning agent socket")?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))
        .context("setting agent dir mode")?;

    info!(session = %shared_id, socket = %sock_path.display(), "agent forwarding enabled");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((mut local, _)) = accepted else { break };
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        match handle.channel_open_agent().await {
                            Ok(channel) => {
                                let mut remote = channel.into_stream();
                                let _ = tokio::io::copy_bidirectional(&mut local, &mut remote).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "opening agent channel failed");
                            }
                        }
                    });
                }
            }
        }
    });

    Ok(AgentForward {
        sock_path,
        dir,
        task,
    })
}
