use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default, rename = "peers")]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Overlay address and port to accept SSH connections on.
    pub listen: String,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// State directory; session recordings land under `<var_root>/ssh-sessions`.
    #[serde(default = "default_var_root")]
    pub var_root: PathBuf,
    #[serde(default = "default_sftp_server_path")]
    pub sftp_server_path: PathBuf,
    /// Address ranges considered part of the overlay network.
    #[serde(default = "default_overlay_cidrs")]
    pub overlay_cidrs: Vec<IpNet>,
    /// Seconds to wait for sessions to drain on shutdown before forcing exit.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("host_key")
}

fn default_server_id() -> String {
    "SSH-2.0-meshssh".to_string()
}

fn default_var_root() -> PathBuf {
    PathBuf::from("/var/lib/meshssh")
}

fn default_sftp_server_path() -> PathBuf {
    PathBuf::from("/usr/lib/openssh/sftp-server")
}

pub fn default_overlay_cidrs() -> Vec<IpNet> {
    vec![
        "100.64.0.0/10".parse().expect("valid CGNAT range literal"),
        "fd7a:115c:a1e0::/48"
            .parse()
            .expect("valid overlay ULA range literal"),
    ]
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// This node's own identity on the overlay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: i64,
    pub stable_id: String,
    /// This node's overlay address; used in delegate-URL expansion.
    pub overlay_ip: IpAddr,
}

/// Control-plane HTTP transport used for action delegation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Bearer token attached to delegation requests.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// One known peer on the overlay, as the identity service reports it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub ip: IpAddr,
    pub node_id: i64,
    pub stable_id: String,
    pub login_name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Inline JSON policy document, standing in for the control plane's
    /// netmap policy field.
    #[serde(default)]
    pub document: Option<serde_json::Value>,
    /// Path to a JSON policy file; re-read on every evaluation when set
    /// (same semantics as the MESHSSH_POLICY_FILE knob).
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}
