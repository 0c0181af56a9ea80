use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::{text::encode, EncodeLabelSet};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result label for terminal-action outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabel {
    pub result: String,
}

pub mod terminal_results {
    pub const ACCEPT: &str = "accept";
    pub const REJECT: &str = "reject";
    pub const MALFORMED: &str = "malformed";
    pub const FETCH_ERROR: &str = "fetch_error";
}

/// Centralized metrics registry for the SSH server.
pub struct MetricsRegistry {
    pub registry: Registry,
    pub active_sessions: Gauge,
    pub incoming_connections: Counter,
    pub publickey_connections: Counter,
    pub publickey_accepts: Counter,
    pub terminal_action: Family<ResultLabel, Counter>,
    pub holds: Counter,
    pub policy_change_kicks: Counter,
    pub sftp_requests: Counter,
    pub local_forward_requests: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_sessions = Gauge::default();
        registry.register(
            "meshssh_active_sessions",
            "Currently running SSH sessions",
            active_sessions.clone(),
        );

        let incoming_connections = Counter::default();
        registry.register(
            "meshssh_incoming_connections",
            "Total incoming SSH connections",
            incoming_connections.clone(),
        );

        let publickey_connections = Counter::default();
        registry.register(
            "meshssh_publickey_connections",
            "Connections that presented a public key",
            publickey_connections.clone(),
        );

        let publickey_accepts = Counter::default();
        registry.register(
            "meshssh_publickey_accepts",
            "Connections accepted via public key",
            publickey_accepts.clone(),
        );

        let terminal_action = Family::<ResultLabel, Counter>::default();
        registry.register(
            "meshssh_terminal_action",
            "Terminal action-chain outcomes by result",
            terminal_action.clone(),
        );

        let holds = Counter::default();
        registry.register(
            "meshssh_holds",
            "Handshakes suspended for action delegation",
            holds.clone(),
        );

        let policy_change_kicks = Counter::default();
        registry.register(
            "meshssh_policy_change_kicks",
            "Sessions terminated because a policy change revoked access",
            policy_change_kicks.clone(),
        );

        let sftp_requests = Counter::default();
        registry.register(
            "meshssh_sftp_requests",
            "SFTP subsystem requests",
            sftp_requests.clone(),
        );

        let local_forward_requests = Counter::default();
        registry.register(
            "meshssh_local_port_forward_requests",
            "Permitted local port-forward requests",
            local_forward_requests.clone(),
        );

        Self {
            registry,
            active_sessions,
            incoming_connections,
            publickey_connections,
            publickey_accepts,
            terminal_action,
            holds,
            policy_change_kicks,
            sftp_requests,
            local_forward_requests,
        }
    }

    pub fn record_terminal(&self, result: &str) {
        self.terminal_action
            .get_or_create(&ResultLabel {
                result: result.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve the Prometheus text endpoint until `shutdown` fires.
pub async fn start_metrics_server(
    listen_addr: &str,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(|| async { "ok" }))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<MetricsRegistry>>,
) -> impl IntoResponse {
    let mut buffer = String::new();
    if encode(&mut buffer, &metrics.registry).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}
