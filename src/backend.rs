//! The node backend: everything the SSH server needs from the rest of the
//! mesh node. Kept behind a trait so tests can substitute a scripted
//! implementation, and so the server core stays independent of how the
//! node learns about peers and talks to the control plane.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::types::AppConfig;
use crate::identity::{PeerNode, StableNodeId, UserProfile};
use crate::policy::SshPolicy;

/// The slice of the node's network map the SSH server consumes.
#[derive(Debug, Clone)]
pub struct NetMap {
    pub self_node_id: i64,
    pub ssh_policy: Option<Arc<SshPolicy>>,
}

/// Response from the control-plane transport for a delegation fetch.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether this node should be serving SSH at all.
    fn should_run_ssh(&self) -> bool {
        true
    }

    /// Current network map, if the node has one.
    fn net_map(&self) -> Option<NetMap>;

    /// Identify the peer behind an overlay source address.
    fn who_is(&self, src: IpAddr) -> Option<(PeerNode, UserProfile)>;

    /// State directory for recordings; `None` disables recording storage.
    fn var_root(&self) -> Option<PathBuf>;

    /// Perform a GET over the authenticated control-plane transport.
    async fn control_get(&self, url: &str) -> Result<ControlResponse>;
}

/// Backend wired from static configuration: a fixed peer table, an inline
/// or file-based policy document, and a bearer-token HTTP transport to the
/// control plane.
pub struct StaticBackend {
    self_node_id: i64,
    var_root: PathBuf,
    peers: HashMap<IpAddr, (PeerNode, UserProfile)>,
    policy: Option<Arc<SshPolicy>>,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl StaticBackend {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let peers = cfg
            .peers
            .iter()
            .map(|p| {
                (
                    p.ip,
                    (
                        PeerNode {
                            id: p.node_id,
                            stable_id: StableNodeId(p.stable_id.clone()),
                        },
                        UserProfile {
                            login_name: p.login_name.clone(),
                            display_name: p.display_name.clone(),
                        },
                    ),
                )
            })
            .collect();

        let policy = match &cfg.policy.document {
            Some(doc) => Some(Arc::new(
                serde_json::from_value(doc.clone()).context("parsing policy.document")?,
            )),
            None => None,
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building control-plane HTTP client")?;

        Ok(Self {
            self_node_id: cfg.node.id,
            var_root: cfg.server.var_root.clone(),
            peers,
            policy,
            auth_token: cfg.control.auth_token.clone(),
            http,
        })
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn net_map(&self) -> Option<NetMap> {
        Some(NetMap {
            self_node_id: self.self_node_id,
            ssh_policy: self.policy.clone(),
        })
    }

    fn who_is(&self, src: IpAddr) -> Option<(PeerNode, UserProfile)> {
        self.peers.get(&src).cloned()
    }

    fn var_root(&self) -> Option<PathBuf> {
        Some(self.var_root.clone())
    }

    async fn control_get(&self, url: &str) -> Result<ControlResponse> {
        let mut req = self.http.get(url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.context("control-plane request")?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("control-plane body")?.to_vec();
        Ok(ControlResponse { status, body })
    }
}
