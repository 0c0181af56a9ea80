//! Process-wide SSH server state and the accept loop.
//!
//! The server owns the set of active connections, the shutdown fence, the
//! session wait-group, and the public-key list cache. Lock order: the
//! server lock is always acquired before any connection lock, never the
//! reverse.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use russh::keys::{Algorithm, PrivateKey};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, StaticBackend};
use crate::config::types::AppConfig;
use crate::conn::{check_still_valid, ConnShared, SshConnection};
use crate::identity::OverlayRanges;
use crate::keycache::{PubKeyCache, PubKeyCacheEntry};
use crate::metrics::{start_metrics_server, MetricsRegistry};
use crate::session::SshSession;

/// Public-key list fetch: total time allowed per request.
const PUBKEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Public-key list responses are read up to this many bytes.
const PUBKEY_BODY_CAP: usize = 4 << 10;

struct ServerLocked {
    active_conns: HashMap<String, Arc<ConnShared>>,
    key_cache: PubKeyCache,
    shutdown_called: bool,
}

/// Shared state for the whole SSH server.
pub struct SshServer {
    overlay: OverlayRanges,
    policy_file: Option<PathBuf>,
    sftp_server_path: PathBuf,
    backend: Arc<dyn Backend>,
    pub metrics: Arc<MetricsRegistry>,
    locked: StdMutex<ServerLocked>,
    sessions: TaskTracker,
    http: reqwest::Client,
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

/// Constructor inputs for [`SshServer`], so tests can assemble a server
/// without a full config file.
pub struct ServerOptions {
    pub overlay: OverlayRanges,
    pub policy_file: Option<PathBuf>,
    pub sftp_server_path: PathBuf,
    pub backend: Arc<dyn Backend>,
    pub metrics: Arc<MetricsRegistry>,
}

impl SshServer {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            overlay: opts.overlay,
            policy_file: opts.policy_file,
            sftp_server_path: opts.sftp_server_path,
            backend: opts.backend,
            metrics: opts.metrics,
            locked: StdMutex::new(ServerLocked {
                active_conns: HashMap::new(),
                key_cache: PubKeyCache::default(),
                shutdown_called: false,
            }),
            sessions: TaskTracker::new(),
            http: reqwest::Client::new(),
            now_fn: Box::new(Utc::now),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn Backend>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self::new(ServerOptions {
            overlay: OverlayRanges::new(config.server.overlay_cidrs.clone()),
            policy_file: config.policy.file.clone(),
            sftp_server_path: config.server.sftp_server_path.clone(),
            backend,
            metrics,
        })
    }

    /// Override the clock, for cache-expiry tests.
    pub fn set_clock(&mut self, now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>) {
        self.now_fn = now_fn;
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_fn)()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn overlay(&self) -> &OverlayRanges {
        &self.overlay
    }

    pub fn policy_file(&self) -> &Option<PathBuf> {
        &self.policy_file
    }

    pub fn sftp_server_path(&self) -> &Path {
        &self.sftp_server_path
    }

    pub fn is_shutdown(&self) -> bool {
        self.locked().shutdown_called
    }

    pub fn active_conn_count(&self) -> usize {
        self.locked().active_conns.len()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, ServerLocked> {
        self.locked.lock().expect("server lock poisoned")
    }

    /// Attach a session to its connection under the shutdown fence.
    /// Reports whether the session may run; after `shutdown` no session
    /// ever attaches.
    pub fn attach_session(&self, conn: &Arc<ConnShared>, sess: &Arc<SshSession>) -> bool {
        let lk = self.locked();
        if lk.shutdown_called {
            return false;
        }
        // Connection lock nests inside the server lock, never the reverse.
        conn.attach(sess.clone());
        true
    }

    pub fn detach_session(&self, conn: &Arc<ConnShared>, sess: &Arc<SshSession>) {
        conn.detach(&sess.shared_id);
    }

    /// Wrap a session future so `shutdown` can wait for it.
    pub fn track_session<F>(&self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        self.sessions.track_future(future)
    }

    /// Set the fence, close every active connection, and wait for all
    /// sessions to finish.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<ConnShared>> = {
            let mut lk = self.locked();
            lk.shutdown_called = true;
            lk.active_conns.values().cloned().collect()
        };
        for conn in conns {
            conn.cancel.cancel();
        }
        self.sessions.close();
        self.sessions.wait().await;
    }

    /// Re-validate every identified connection against the latest policy,
    /// off-thread. Connections still in the auth phase are checked when
    /// their auth completes.
    pub fn on_policy_change(self: &Arc<Self>) {
        let conns: Vec<Arc<ConnShared>> = self.locked().active_conns.values().cloned().collect();
        for conn in conns {
            if conn.info().is_some() {
                tokio::spawn(check_still_valid(self.clone(), conn));
            }
        }
    }

    /// Fetch an authorized-key list, serving from the TTL cache when
    /// fresh. Sends `If-None-Match` when an ETag is cached; a `304`
    /// refreshes the entry, any other non-200 leaves the cache untouched
    /// and reports an error.
    pub async fn fetch_public_keys_url(&self, url: &str) -> Result<Vec<String>> {
        if !url.starts_with("https://") {
            bail!("invalid public key URL scheme: {url}");
        }

        let now = self.now();
        let (cached, fresh) = self.locked().key_cache.get(url, now);
        if fresh {
            return Ok(cached.lines);
        }

        let mut req = self.http.get(url).timeout(PUBKEY_FETCH_TIMEOUT);
        if !cached.etag.is_empty() {
            req = req.header(reqwest::header::IF_NONE_MATCH, cached.etag.clone());
        }
        let resp = req.send().await.context("public key list request")?;

        let (lines, etag) = match resp.status().as_u16() {
            200 => {
                let etag = resp
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let body = read_capped(resp, PUBKEY_BODY_CAP).await?;
                let text = String::from_utf8_lossy(&body);
                let lines: Vec<String> = text
                    .trim()
                    .lines()
                    .map(|l| l.to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
                (lines, etag)
            }
            304 => (cached.lines.clone(), cached.etag.clone()),
            status => {
                warn!(url = %url, status = status, "unexpected public key list status");
                bail!("unexpected status {status} fetching {url}");
            }
        };

        self.locked().key_cache.insert(
            url.to_string(),
            PubKeyCacheEntry {
                lines: lines.clone(),
                etag,
                at: self.now(),
            },
        );
        Ok(lines)
    }

    /// Handle one raw connection: the entry point for all SSH traffic.
    /// Registers the connection for the duration of the call.
    pub async fn handle_ssh_conn(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        russh_config: Arc<russh::server::Config>,
    ) -> Result<()> {
        self.metrics.incoming_connections.inc();
        if self.is_shutdown() {
            bail!("connection denied: server is shutting down");
        }
        let peer_addr = stream.peer_addr().context("peer address")?;
        let local_addr = stream.local_addr().context("local address")?;

        let handler = SshConnection::new(self.clone(), peer_addr, local_addr);
        let shared = handler.shared.clone();
        let conn_id = shared.conn_id.clone();
        self.locked()
            .active_conns
            .insert(conn_id.clone(), shared.clone());
        info!(conn_id = %conn_id, peer = %peer_addr, "new SSH connection");

        match russh::server::run_stream(russh_config, stream, handler).await {
            Ok(mut session) => {
                tokio::select! {
                    result = &mut session => {
                        if let Err(e) = result {
                            debug!(conn_id = %conn_id, error = %e, "connection ended with error");
                        }
                    }
                    // Shutdown (or an explicit close) cancels the token;
                    // tear the transport down so the client sees it.
                    _ = shared.cancel.cancelled() => {
                        let _ = session
                            .handle()
                            .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                            .await;
                        let _ = tokio::time::timeout(Duration::from_secs(5), session).await;
                    }
                }
            }
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "connection setup failed");
            }
        }

        self.locked().active_conns.remove(&conn_id);
        Ok(())
    }
}

async fn read_capped(mut resp: reqwest::Response, cap: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.context("public key list body")? {
        let remaining = cap - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if body.len() >= cap {
            break;
        }
    }
    Ok(body)
}

/// Load or generate an Ed25519 host key
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let key_bytes = std::fs::read_to_string(path)
            .with_context(|| format!("reading host key: {}", path.display()))?;
        russh::keys::decode_secret_key(&key_bytes, None)
            .map_err(|e| anyhow::anyhow!("decoding host key: {e}"))
    } else {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {e}"))?;
        save_host_key(&key, path)?;
        Ok(key)
    }
}

fn save_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }
    }

    let mut buf = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut buf)
        .map_err(|e| anyhow::anyhow!("encoding host key: {e}"))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating host key file: {}", path.display()))?;
        file.write_all(&buf)
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, &buf)
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }
    Ok(())
}

/// Build the transport configuration shared by all connections.
pub fn build_russh_config(config: &AppConfig, host_key: PrivateKey) -> Arc<russh::server::Config> {
    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = russh::SshId::Standard(config.server.server_id.clone());
    ssh_config.auth_rejection_time = Duration::from_secs(1);
    ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    Arc::new(ssh_config)
}

/// Main server orchestrator: bind, accept, and hand each connection to
/// [`SshServer::handle_ssh_conn`]; drain sessions on shutdown signals.
pub async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let metrics = Arc::new(MetricsRegistry::new());
    let backend = Arc::new(StaticBackend::from_config(&config)?);
    let srv = Arc::new(SshServer::from_config(&config, backend, metrics.clone()));

    let host_key = load_or_generate_host_key(&config.server.host_key_path)?;
    info!(path = %config.server.host_key_path.display(), "Host key loaded");
    let russh_config = build_russh_config(&config, host_key);

    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        let listen = config.metrics.listen.clone();
        let metrics = metrics.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&listen, metrics, token).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    spawn_policy_file_watcher(srv.clone(), shutdown.clone());
    tokio::spawn(handle_signals(srv.clone(), shutdown.clone()));

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(addr = %config.server.listen, "SSH server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(timeout = config.server.shutdown_timeout, "Initiating graceful shutdown");
                let drain = srv.shutdown();
                if tokio::time::timeout(Duration::from_secs(config.server.shutdown_timeout), drain)
                    .await
                    .is_err()
                {
                    warn!("Shutdown timeout reached, forcing exit");
                }
                info!("Graceful shutdown complete");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let srv = srv.clone();
                        let russh_config = russh_config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = srv.handle_ssh_conn(stream, russh_config).await {
                                debug!(error = %e, "connection refused");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

/// Watch the policy override file and re-validate live connections when it
/// changes.
fn spawn_policy_file_watcher(srv: Arc<SshServer>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut last_mtime: Option<std::time::SystemTime> = None;
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let path = crate::config::env::policy_file()
                        .or_else(|| srv.policy_file().clone());
                    let Some(path) = path else { continue };
                    let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                    if mtime.is_some() && last_mtime.is_some() && mtime != last_mtime {
                        info!(path = %path.display(), "policy file changed; re-validating connections");
                        srv.on_policy_change();
                    }
                    if mtime.is_some() {
                        last_mtime = mtime;
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
async fn handle_signals(srv: Arc<SshServer>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown");
                shutdown.cancel();
                return;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown");
                shutdown.cancel();
                return;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, re-validating connections against policy");
                srv.on_policy_change();
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(_srv: Arc<SshServer>, shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        shutdown.cancel();
    }
}
