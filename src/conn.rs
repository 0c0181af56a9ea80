//! One SSH connection: handshake callbacks, policy evaluation, and the
//! action-chain resolver.
//!
//! The transport library drives a sequence of callbacks with per-connection
//! state; all of that state lives on [`ConnShared`], which the server also
//! holds so policy changes can re-validate live connections. The `none`
//! auth method is the entry point for identity-based authentication; the
//! public-key method only runs when a rule demands a key, and the password
//! method exists solely as a workaround trampoline for clients that
//! mishandle a successful `none` exchange.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use russh::keys::PublicKeyBase64;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{strip_force_password_suffix, ConnInfo, FORCE_PASSWORD_SUFFIX};
use crate::localuser::LocalAccount;
use crate::metrics::terminal_results;
use crate::policy::{
    self, expand_public_key_url, have_pub_key_policy, map_local_user, SshAction, SshPolicy,
    SshRule,
};
use crate::server::SshServer;
use crate::session::{
    spawn_session, write_stderr_and_exit, PtyRequest, SessionKind, SessionParams, SshSession,
    TerminationCause,
};
use crate::utils::generate_shared_id;

/// Total ceiling for resolving one delegated action. Generous because a
/// human may need to follow a link and approve the connection.
const DELEGATE_FETCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Delegation retry backoff: doubled per attempt from the initial delay,
/// capped at the maximum.
const DELEGATE_BACKOFF_INITIAL_MS: u64 = 1_000;
const DELEGATE_BACKOFF_MAX_MS: u64 = 10_000;
/// Error bodies longer than this are truncated in logs.
const DELEGATE_LOG_BODY_CAP: usize = 1 << 10;

/// Connection state shared between the transport handler and the server.
pub struct ConnShared {
    pub conn_id: String,
    /// Cancelled when the connection ends (client disconnect or shutdown);
    /// session contexts are children of this token.
    pub cancel: CancellationToken,
    mu: StdMutex<ConnLocked>,
}

#[derive(Default)]
struct ConnLocked {
    info: Option<Arc<ConnInfo>>,
    any_password_ok: bool,
    /// First matching action; set by policy auth, untouched by delegation.
    action0: Option<SshAction>,
    /// Advances through the delegation chain.
    current_action: Option<SshAction>,
    /// Set exactly once, when a terminal action is reached.
    final_action: Option<SshAction>,
    final_action_err: Option<String>,
    local_user: Option<Arc<LocalAccount>>,
    pubkey: Option<russh::keys::PublicKey>,
    /// Banner messages not yet surfaced to the client.
    queued_banners: Vec<String>,
    sessions: Vec<Arc<SshSession>>,
}

impl ConnShared {
    pub fn new(conn_id: String) -> Self {
        Self {
            conn_id,
            cancel: CancellationToken::new(),
            mu: StdMutex::new(ConnLocked::default()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, ConnLocked> {
        self.mu.lock().expect("connection lock poisoned")
    }

    pub fn info(&self) -> Option<Arc<ConnInfo>> {
        self.locked().info.clone()
    }

    pub fn final_action(&self) -> Option<SshAction> {
        self.locked().final_action.clone()
    }

    pub fn local_account(&self) -> Option<Arc<LocalAccount>> {
        self.locked().local_user.clone()
    }

    pub fn client_pubkey(&self) -> Option<russh::keys::PublicKey> {
        self.locked().pubkey.clone()
    }

    pub fn any_password_ok(&self) -> bool {
        self.locked().any_password_ok
    }

    pub fn queue_banner(&self, message: &str) {
        self.locked().queued_banners.push(message.to_string());
    }

    pub fn take_banners(&self) -> Vec<String> {
        std::mem::take(&mut self.locked().queued_banners)
    }

    pub fn queued_banners(&self) -> Vec<String> {
        self.locked().queued_banners.clone()
    }

    pub fn attach(&self, sess: Arc<SshSession>) {
        self.locked().sessions.push(sess);
    }

    pub fn detach(&self, shared_id: &str) {
        self.locked().sessions.retain(|s| s.shared_id != shared_id);
    }

    pub fn sessions(&self) -> Vec<Arc<SshSession>> {
        self.locked().sessions.clone()
    }

    /// Store a freshly fetched action. Terminal actions also freeze
    /// `final_action`; an already-frozen final action is never reassigned.
    fn advance_action(&self, action: SshAction) {
        let mut lk = self.locked();
        if action.is_terminal() && lk.final_action.is_none() {
            lk.final_action = Some(action.clone());
        }
        lk.current_action = Some(action);
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("no SSH policy")]
    NoPolicy,
    #[error("no matching policy rule")]
    NoMatch,
}

/// Outcome of the policy step of one auth callback. Tagged results, not
/// errors: "public-key required" and "any password" are control flow
/// between callback layers.
enum PolicyAuthOutcome {
    /// Matched an accept or hold rule; the action chain may still need
    /// resolving.
    Proceed,
    /// No match without a key, but a key-bearing rule could match.
    PubKeyRequired,
    Denied,
}

/// Per-channel bookkeeping between open and session start.
#[derive(Default)]
struct ChannelState {
    pty: Option<PtyRequest>,
    env: HashMap<String, String>,
    agent_requested: bool,
    session: Option<Arc<SshSession>>,
}

/// Transport handler for a single connection.
pub struct SshConnection {
    srv: Arc<SshServer>,
    pub shared: Arc<ConnShared>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    channels: DashMap<ChannelId, ChannelState>,
}

impl SshConnection {
    pub fn new(srv: Arc<SshServer>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let conn_id = generate_shared_id("ssh-conn", srv.now());
        Self {
            srv,
            shared: Arc::new(ConnShared::new(conn_id)),
            peer_addr,
            local_addr,
            channels: DashMap::new(),
        }
    }

    /// Populate [`ConnInfo`] if not already set. Rejects endpoints outside
    /// the overlay and sources the identity service does not know.
    fn set_info(&self, requested_user: &str) -> Result<()> {
        if self.shared.info().is_some() {
            return Ok(());
        }
        let (ssh_user, _) = strip_force_password_suffix(requested_user);

        if !self.srv.overlay().contains(self.local_addr.ip()) {
            bail!("rejecting non-overlay local address {}", self.local_addr);
        }
        if !self.srv.overlay().contains(self.peer_addr.ip()) {
            bail!("rejecting non-overlay remote address {}", self.peer_addr);
        }
        let (node, user_profile) = self
            .srv
            .backend()
            .who_is(self.peer_addr.ip())
            .with_context(|| format!("unknown peer identity from src {}", self.peer_addr))?;

        let info = Arc::new(ConnInfo {
            ssh_user: ssh_user.to_string(),
            src: self.peer_addr,
            dst: self.local_addr,
            node,
            user_profile,
        });
        info!(conn_id = %self.shared.conn_id, conn = %info, "handling conn");
        self.shared.locked().info = Some(info);
        Ok(())
    }

    /// Verify that this connection may proceed with the given optional
    /// public key, storing the matched action and the resolved local
    /// account on success.
    async fn policy_auth(
        &mut self,
        requested_user: &str,
        pubkey: Option<&russh::keys::PublicKey>,
    ) -> PolicyAuthOutcome {
        if let Err(e) = self.set_info(requested_user) {
            warn!(conn_id = %self.shared.conn_id, error = %e, "failed to establish conn info");
            return PolicyAuthOutcome::Denied;
        }
        let info = self.shared.info().expect("info set above");

        let (action, local_user) = match eval_ssh_policy(&self.srv, &info, pubkey).await {
            Ok(matched) => matched,
            Err(e) => {
                if pubkey.is_none() {
                    if let Some(pol) = ssh_policy(&self.srv) {
                        if have_pub_key_policy(&pol, &info, self.srv.now()) {
                            return PolicyAuthOutcome::PubKeyRequired;
                        }
                    }
                }
                debug!(conn_id = %self.shared.conn_id, error = %e, "policy evaluation denied");
                return PolicyAuthOutcome::Denied;
            }
        };

        {
            let mut lk = self.shared.locked();
            lk.action0 = Some(action.clone());
            lk.current_action = Some(action.clone());
            lk.pubkey = pubkey.cloned();
        }
        if !action.message.is_empty() {
            self.shared.queue_banner(&action.message);
        }

        if action.accept || !action.hold_and_delegate.is_empty() {
            if action.accept {
                self.srv.metrics.record_terminal(terminal_results::ACCEPT);
                self.shared.advance_action(action);
            }
            let account = match LocalAccount::lookup(&local_user) {
                Ok(acct) => acct,
                Err(e) => {
                    warn!(conn_id = %self.shared.conn_id, user = %local_user, error = %e, "local user lookup failed");
                    self.shared
                        .queue_banner(&format!("failed to look up {local_user}\r\n"));
                    return PolicyAuthOutcome::Denied;
                }
            };
            self.shared.locked().local_user = Some(Arc::new(account));
            return PolicyAuthOutcome::Proceed;
        }

        if action.reject {
            self.srv.metrics.record_terminal(terminal_results::REJECT);
            self.shared.advance_action(action);
        }
        PolicyAuthOutcome::Denied
    }

    /// Walk the action chain until a terminal action decides the
    /// connection. Returns `true` iff the connection is authorized.
    async fn is_authorized(&mut self) -> bool {
        let mut action = match self.shared.locked().current_action.clone() {
            Some(a) => a,
            None => return false,
        };
        loop {
            if action.accept {
                return true;
            }
            if action.reject {
                return false;
            }
            match self.resolve_next_action().await {
                Ok(next) => {
                    if !next.message.is_empty() {
                        self.shared.queue_banner(&next.message);
                    }
                    action = next;
                }
                Err(e) => {
                    warn!(conn_id = %self.shared.conn_id, error = %e, "action resolution failed");
                    return false;
                }
            }
        }
    }

    /// One step of the delegation chain. Idempotent once a terminal action
    /// has been reached.
    pub async fn resolve_next_action(&self) -> Result<SshAction> {
        {
            let lk = self.shared.locked();
            if let Some(final_action) = lk.final_action.clone() {
                return Ok(final_action);
            }
            if let Some(err) = &lk.final_action_err {
                bail!("{err}");
            }
        }
        let current = self
            .shared
            .locked()
            .current_action
            .clone()
            .context("no current action to resolve")?;
        if current.is_terminal() {
            return Ok(current);
        }
        if current.hold_and_delegate.is_empty() {
            self.srv
                .metrics
                .record_terminal(terminal_results::MALFORMED);
            let msg = "reached action that lacked accept, reject, and holdAndDelegate";
            self.shared.locked().final_action_err = Some(msg.to_string());
            bail!("{msg}");
        }

        self.srv.metrics.holds.inc();
        let url = self.expand_delegate_url(&current.hold_and_delegate);
        match self.fetch_ssh_action(&url).await {
            Ok(next) => {
                if next.is_terminal() {
                    self.srv.metrics.record_terminal(if next.accept {
                        terminal_results::ACCEPT
                    } else {
                        terminal_results::REJECT
                    });
                }
                self.shared.advance_action(next.clone());
                Ok(next)
            }
            Err(e) => {
                self.srv
                    .metrics
                    .record_terminal(terminal_results::FETCH_ERROR);
                self.shared.locked().final_action_err = Some(e.to_string());
                Err(e.context(format!("fetching next action from {url}")))
            }
        }
    }

    /// Fetch and decode the next action from the control plane, retrying
    /// non-200 responses and transport errors with exponential backoff,
    /// bounded by the delegation ceiling and the connection's lifetime.
    async fn fetch_ssh_action(&self, url: &str) -> Result<SshAction> {
        let fetch_loop = async {
            let mut delay = Duration::from_millis(DELEGATE_BACKOFF_INITIAL_MS);
            loop {
                match self.srv.backend().control_get(url).await {
                    Ok(resp) if resp.status == 200 => {
                        match serde_json::from_slice::<SshAction>(&resp.body) {
                            Ok(action) => return Ok(action),
                            Err(e) => {
                                warn!(conn_id = %self.shared.conn_id, url = %url, error = %e, "invalid action JSON");
                            }
                        }
                    }
                    Ok(resp) => {
                        let body = &resp.body[..resp.body.len().min(DELEGATE_LOG_BODY_CAP)];
                        warn!(
                            conn_id = %self.shared.conn_id,
                            url = %url,
                            status = resp.status,
                            body = %String::from_utf8_lossy(body),
                            "unexpected delegation status"
                        );
                    }
                    Err(e) => {
                        warn!(conn_id = %self.shared.conn_id, url = %url, error = %e, "delegation fetch error");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shared.cancel.cancelled() => bail!("connection closed during delegation"),
                }
                delay = (delay * 2).min(Duration::from_millis(DELEGATE_BACKOFF_MAX_MS));
            }
        };

        match tokio::time::timeout(DELEGATE_FETCH_TIMEOUT, fetch_loop).await {
            Ok(result) => result,
            Err(_) => bail!("delegation did not resolve within {DELEGATE_FETCH_TIMEOUT:?}"),
        }
    }

    /// Expand the delegate-URL tokens. Values that are not already plain
    /// integers are query-escaped.
    fn expand_delegate_url(&self, action_url: &str) -> String {
        let lk = self.shared.locked();
        let info = lk.info.as_ref().expect("info set before delegation");
        let local_user = lk
            .local_user
            .as_ref()
            .map(|a| a.username.clone())
            .unwrap_or_default();
        let dst_node_id = self
            .srv
            .backend()
            .net_map()
            .map(|nm| nm.self_node_id.to_string())
            .unwrap_or_default();

        action_url
            .replace("$SRC_NODE_IP", &query_escape(&info.src.ip().to_string()))
            .replace("$SRC_NODE_ID", &info.node.id.to_string())
            .replace("$DST_NODE_IP", &query_escape(&info.dst.ip().to_string()))
            .replace("$DST_NODE_ID", &dst_node_id)
            .replace("$SSH_USER", &query_escape(&info.ssh_user))
            .replace("$LOCAL_USER", &query_escape(&local_user))
    }

    /// Launch a session on an accepted channel. The channel must have been
    /// opened after a terminal accept; anything else is a protocol error.
    async fn start_session(
        &mut self,
        channel_id: ChannelId,
        kind: SessionKind,
        session: &mut Session,
    ) -> Result<()> {
        let handle = session.handle();
        let final_action = self.shared.final_action();
        let account = self.shared.local_account();
        let (Some(final_action), Some(account)) = (final_action, account) else {
            warn!(conn_id = %self.shared.conn_id, "session request before terminal accept");
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        if !final_action.accept {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }

        // Snapshot the channel state; the map guard must not be held
        // across the sends below.
        let (pty, env, agent_requested) = {
            let Some(state) = self.channels.get(&channel_id) else {
                let _ = session.channel_failure(channel_id);
                return Ok(());
            };
            if state.session.is_some() {
                let _ = session.channel_failure(channel_id);
                return Ok(());
            }
            (state.pty.clone(), state.env.clone(), state.agent_requested)
        };

        // Accept-path messages surface before any child output.
        for banner in self.shared.take_banners() {
            let framed = format!("{}\r\n", banner.trim_end_matches(['\r', '\n']));
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(framed.as_bytes()))
                .await;
        }

        let info = self.shared.info().expect("info set before session");
        info!(
            conn_id = %self.shared.conn_id,
            peer = %info.user_profile.login_name,
            src = %info.src.ip(),
            local_user = %account.username,
            "access granted"
        );

        let sess = spawn_session(SessionParams {
            srv: self.srv.clone(),
            conn: self.shared.clone(),
            channel_id,
            handle,
            kind,
            pty,
            env,
            agent_requested,
            final_action,
            account,
        });
        if let Some(mut state) = self.channels.get_mut(&channel_id) {
            state.session = Some(sess);
        }
        let _ = session.channel_success(channel_id);
        Ok(())
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        // Connection gone: sessions are children of this token.
        self.shared.cancel.cancel();
    }
}

fn reject(methods: &[MethodKind]) -> Auth {
    Auth::Reject {
        proceed_with_methods: if methods.is_empty() {
            None
        } else {
            Some(MethodSet::from(methods))
        },
        partial_success: false,
    }
}

impl russh::server::Handler for SshConnection {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.srv.is_shutdown() {
            return Ok(reject(&[]));
        }
        match self.policy_auth(user, None).await {
            PolicyAuthOutcome::Proceed => {
                if !self.is_authorized().await {
                    return Ok(reject(&[]));
                }
                // Buggy clients get confused by success on "none"; a
                // +password suffix asks for a throwaway password round.
                if user.ends_with(FORCE_PASSWORD_SUFFIX) {
                    self.shared.locked().any_password_ok = true;
                    return Ok(reject(&[MethodKind::Password]));
                }
                Ok(Auth::Accept)
            }
            PolicyAuthOutcome::PubKeyRequired => Ok(reject(&[MethodKind::PublicKey])),
            PolicyAuthOutcome::Denied => Ok(reject(&[])),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.srv.metrics.publickey_connections.inc();
        if self.srv.is_shutdown() {
            return Ok(reject(&[]));
        }
        let key_display = format!(
            "{} {}",
            public_key.algorithm().as_str(),
            public_key.public_key_base64()
        );
        match self.policy_auth(user, Some(public_key)).await {
            PolicyAuthOutcome::Proceed => {
                if self.is_authorized().await {
                    info!(conn_id = %self.shared.conn_id, key = %key_display, "accepting SSH public key");
                    self.srv.metrics.publickey_accepts.inc();
                    Ok(Auth::Accept)
                } else {
                    warn!(conn_id = %self.shared.conn_id, key = %key_display, "rejecting SSH public key");
                    Ok(reject(&[]))
                }
            }
            _ => {
                warn!(conn_id = %self.shared.conn_id, key = %key_display, "rejecting SSH public key");
                Ok(reject(&[]))
            }
        }
    }

    /// No password is ever checked: this accepts anything iff the
    /// connection was already authorized via the `+password` workaround.
    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        if self.shared.any_password_ok() {
            Ok(Auth::Accept)
        } else {
            Ok(reject(&[]))
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let authorized = self
            .shared
            .final_action()
            .map(|a| a.accept)
            .unwrap_or(false);
        if !authorized {
            return Ok(false);
        }
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut state) = self.channels.get_mut(&channel) {
            state.pty = Some(PtyRequest {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            });
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accepted = matches!(variable_name, "TERM" | "LANG") || variable_name.starts_with("LC_");
        if accepted {
            if let Some(mut state) = self.channels.get_mut(&channel) {
                state
                    .env
                    .insert(variable_name.to_string(), variable_value.to_string());
            }
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let allowed = self
            .shared
            .final_action()
            .map(|a| a.allow_agent_forwarding)
            .unwrap_or(false);
        if allowed {
            if let Some(mut state) = self.channels.get_mut(&channel) {
                state.agent_requested = true;
            }
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(allowed)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, SessionKind::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        self.start_session(channel, SessionKind::Exec(command), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "sftp" {
            self.srv.metrics.sftp_requests.inc();
            return self.start_session(channel, SessionKind::Sftp, session).await;
        }
        warn!(conn_id = %self.shared.conn_id, subsystem = %name, "unsupported subsystem");
        let handle = session.handle();
        write_stderr_and_exit(
            &handle,
            channel,
            &format!("Unsupported subsystem {name:?}\r\n"),
            1,
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut state) = self.channels.get_mut(&channel) {
            if let Some(pty) = &mut state.pty {
                pty.cols = col_width;
                pty.rows = row_height;
            }
            if let Some(sess) = &state.session {
                sess.resize(col_width, row_height);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(sess) = state.session.as_ref() {
                sess.write_input(data);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(sess) = state.session.as_ref() {
                sess.input_eof();
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some((_, state)) = self.channels.remove(&channel) {
            if let Some(sess) = state.session {
                sess.ctx.close_with(TerminationCause {
                    reason: "channel closed".into(),
                    user_message: None,
                });
            }
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let allowed = self
            .shared
            .final_action()
            .map(|a| a.accept && a.allow_local_port_forwarding)
            .unwrap_or(false);
        if !allowed {
            return Ok(false);
        }
        self.srv.metrics.local_forward_requests.inc();

        let host = host_to_connect.to_string();
        let port = match u16::try_from(port_to_connect) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        debug!(
            conn_id = %self.shared.conn_id,
            target = %format!("{host}:{port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip channel open"
        );

        let conn_id = self.shared.conn_id.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            let target = match tokio::net::TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(conn_id = %conn_id, target = %format!("{host}:{port}"), error = %e, "forward connect failed");
                    return;
                }
            };
            let mut target = target;
            let mut channel_stream = channel.into_stream();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::io::copy_bidirectional(&mut target, &mut channel_stream) => {
                    if let Err(e) = res {
                        debug!(conn_id = %conn_id, error = %e, "forward relay ended");
                    }
                }
            }
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Remote port forwarding is not offered.
        Ok(false)
    }
}

const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn query_escape(s: &str) -> String {
    utf8_percent_encode(s, QUERY_ESCAPE).to_string()
}

/// The policy in effect right now. The netmap policy wins unless disabled;
/// an override file is re-read and parsed on every call so edits take
/// effect immediately.
pub fn ssh_policy(srv: &SshServer) -> Option<Arc<SshPolicy>> {
    if !srv.backend().should_run_ssh() {
        return None;
    }
    if !crate::config::env::ignore_mesh_policy() {
        if let Some(pol) = srv.backend().net_map().and_then(|nm| nm.ssh_policy) {
            return Some(pol);
        }
    }
    let path = crate::config::env::policy_file().or_else(|| srv.policy_file().clone())?;
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error reading policy file");
            return None;
        }
    };
    match serde_json::from_slice::<SshPolicy>(&raw) {
        Ok(pol) => Some(Arc::new(pol)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid JSON in policy file");
            None
        }
    }
}

/// Evaluate the current policy for this connection. The first matching
/// rule decides.
pub async fn eval_ssh_policy(
    srv: &SshServer,
    info: &ConnInfo,
    pubkey: Option<&russh::keys::PublicKey>,
) -> Result<(SshAction, String), EvalError> {
    let pol = ssh_policy(srv).ok_or(EvalError::NoPolicy)?;
    let now = srv.now();
    for rule in &pol.rules {
        if let Some(matched) = match_rule(srv, info, rule, pubkey, now).await {
            return Ok(matched);
        }
    }
    Err(EvalError::NoMatch)
}

async fn match_rule(
    srv: &SshServer,
    info: &ConnInfo,
    rule: &SshRule,
    pubkey: Option<&russh::keys::PublicKey>,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<(SshAction, String)> {
    let action = rule.action.as_ref()?;
    if rule.expired(now) {
        return None;
    }
    // Reject rules match without a user mapping; everything else needs one.
    let local_user = if action.reject {
        map_local_user(&rule.ssh_users, &info.ssh_user)
    } else {
        let mapped = map_local_user(&rule.ssh_users, &info.ssh_user);
        if mapped.is_empty() {
            return None;
        }
        mapped
    };
    for principal in &rule.principals {
        if !policy::principal_matches_identity(principal, info) {
            continue;
        }
        if principal_matches_pubkey(srv, info, &principal.pub_keys, pubkey).await {
            return Some((action.clone(), local_user));
        }
    }
    None
}

/// Public-key predicate of one principal: vacuously true without a key
/// requirement, otherwise the client key must match a listed entry or an
/// entry of the fetched list. Fetch failures count as no-match: the cache
/// is advisory and can only deny.
async fn principal_matches_pubkey(
    srv: &SshServer,
    info: &ConnInfo,
    pub_keys: &[String],
    pubkey: Option<&russh::keys::PublicKey>,
) -> bool {
    if pub_keys.is_empty() {
        return true;
    }
    let Some(key) = pubkey else {
        return false;
    };
    let entries: Vec<String> = if pub_keys.len() == 1 && pub_keys[0].starts_with("https://") {
        let url = expand_public_key_url(&pub_keys[0], &info.user_profile);
        match srv.fetch_public_keys_url(&url).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(url = %url, error = %e, "public key list fetch failed");
                return false;
            }
        }
    } else {
        pub_keys.to_vec()
    };
    entries
        .iter()
        .any(|entry| policy::pub_key_matches_authorized_key(key, entry))
}

/// Re-evaluate a live connection against the latest policy and tear its
/// sessions down if access is gone.
pub async fn check_still_valid(srv: Arc<SshServer>, conn: Arc<ConnShared>) {
    let Some(info) = conn.info() else { return };
    let pubkey = conn.client_pubkey();
    let current_user = match conn.local_account() {
        Some(acct) => acct.username.clone(),
        None => return,
    };

    let still_valid = match eval_ssh_policy(&srv, &info, pubkey.as_ref()).await {
        Ok((action, local_user)) => {
            (action.accept || !action.hold_and_delegate.is_empty()) && local_user == current_user
        }
        Err(_) => false,
    };
    if still_valid {
        return;
    }

    srv.metrics.policy_change_kicks.inc();
    info!(conn_id = %conn.conn_id, "connection no longer valid per new SSH policy; closing");
    for sess in conn.sessions() {
        sess.ctx.close_with(TerminationCause::revoked());
    }
}
