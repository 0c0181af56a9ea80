//! Shared helpers for integration tests: a scripted backend, server
//! construction, and a client handler that trusts any host key.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use meshssh::backend::{Backend, ControlResponse, NetMap};
use meshssh::identity::{OverlayRanges, PeerNode, StableNodeId, UserProfile};
use meshssh::metrics::MetricsRegistry;
use meshssh::policy::SshPolicy;
use meshssh::server::{ServerOptions, SshServer};

/// Scripted backend: a fixed peer table, a swappable policy, and canned
/// control-plane responses with a request log.
pub struct TestBackend {
    peers: HashMap<IpAddr, (PeerNode, UserProfile)>,
    policy: Mutex<Option<Arc<SshPolicy>>>,
    delegate_responses: Mutex<VecDeque<ControlResponse>>,
    fetch_log: Mutex<Vec<String>>,
    var_root: Option<PathBuf>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            policy: Mutex::new(None),
            delegate_responses: Mutex::new(VecDeque::new()),
            fetch_log: Mutex::new(Vec::new()),
            var_root: None,
        }
    }

    pub fn with_peer(mut self, ip: &str, node_id: i64, stable_id: &str, login: &str) -> Self {
        self.peers.insert(
            ip.parse().unwrap(),
            (
                PeerNode {
                    id: node_id,
                    stable_id: StableNodeId(stable_id.to_string()),
                },
                UserProfile {
                    login_name: login.to_string(),
                    display_name: String::new(),
                },
            ),
        );
        self
    }

    pub fn with_policy(self, policy: serde_json::Value) -> Self {
        *self.policy.lock().unwrap() = Some(Arc::new(serde_json::from_value(policy).unwrap()));
        self
    }

    pub fn with_var_root(mut self, root: PathBuf) -> Self {
        self.var_root = Some(root);
        self
    }

    pub fn set_policy(&self, policy: serde_json::Value) {
        *self.policy.lock().unwrap() = Some(Arc::new(serde_json::from_value(policy).unwrap()));
    }

    pub fn push_delegate_response(&self, status: u16, body: serde_json::Value) {
        self.delegate_responses
            .lock()
            .unwrap()
            .push_back(ControlResponse {
                status,
                body: body.to_string().into_bytes(),
            });
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetch_log.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_log.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for TestBackend {
    fn net_map(&self) -> Option<NetMap> {
        Some(NetMap {
            self_node_id: 100,
            ssh_policy: self.policy.lock().unwrap().clone(),
        })
    }

    fn who_is(&self, src: IpAddr) -> Option<(PeerNode, UserProfile)> {
        self.peers.get(&src).cloned()
    }

    fn var_root(&self) -> Option<PathBuf> {
        self.var_root.clone()
    }

    async fn control_get(&self, url: &str) -> anyhow::Result<ControlResponse> {
        self.fetch_log.lock().unwrap().push(url.to_string());
        let scripted = self.delegate_responses.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(ControlResponse {
            status: 404,
            body: b"no scripted response".to_vec(),
        }))
    }
}

/// Server over the given backend. The overlay ranges include loopback so
/// full-transport tests can connect over 127.0.0.1.
pub fn make_server(backend: Arc<TestBackend>) -> Arc<SshServer> {
    let mut nets = meshssh::config::types::default_overlay_cidrs();
    nets.push("127.0.0.0/8".parse().unwrap());
    Arc::new(SshServer::new(ServerOptions {
        overlay: OverlayRanges::new(nets),
        policy_file: None,
        sftp_server_path: PathBuf::from("/usr/lib/openssh/sftp-server"),
        backend,
        metrics: Arc::new(MetricsRegistry::new()),
    }))
}

/// The account this test process runs as; policies map to it so sessions
/// can spawn without switching users.
pub fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .unwrap()
        .unwrap()
        .name
}

/// Minimal russh client handler for testing
pub struct TestClientHandler;

impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Bind a loopback listener and feed every accepted connection to the
/// server, as the daemon's accept loop does.
pub async fn start_test_server(srv: Arc<SshServer>) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let host_key =
        russh::keys::PrivateKey::random(&mut rand::rngs::OsRng, russh::keys::Algorithm::Ed25519)
            .unwrap();
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.server_id = russh::SshId::Standard("SSH-2.0-meshssh_test".to_string());
    config.auth_rejection_time = Duration::from_millis(100);
    config.auth_rejection_time_initial = Some(Duration::from_millis(0));
    let config = Arc::new(config);

    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let srv = srv.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let _ = srv.handle_ssh_conn(stream, config).await;
            });
        }
    });

    (port, task)
}

/// Connect a russh client to the test server.
pub async fn connect_client(
    port: u16,
) -> russh::client::Handle<TestClientHandler> {
    let client_config = Arc::new(russh::client::Config::default());
    russh::client::connect(
        client_config,
        format!("127.0.0.1:{port}"),
        TestClientHandler,
    )
    .await
    .unwrap()
}
