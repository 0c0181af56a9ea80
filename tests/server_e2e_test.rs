//! Full-transport tests: a russh client against the in-process server over
//! loopback, exercising identity auth, session exec, policy revocation,
//! and the shutdown fence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_client, current_username, make_server, start_test_server, TestBackend};
use russh::ChannelMsg;
use serde_json::json;
use tokio::time::timeout;

fn loopback_backend() -> TestBackend {
    TestBackend::new()
        .with_peer("127.0.0.1", 7, "nPEER", "alice@ex.com")
        .with_policy(json!({
            "rules": [{
                "sshUsers": {"alice": current_username()},
                "principals": [{"userLogin": "alice@ex.com"}],
                "action": {"accept": true}
            }]
        }))
}

struct ExecOutcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u32>,
}

async fn drain_channel(
    channel: &mut russh::Channel<russh::client::Msg>,
    deadline: Duration,
) -> ExecOutcome {
    let mut outcome = ExecOutcome {
        stdout: Vec::new(),
        stderr: Vec::new(),
        exit_code: None,
    };
    let _ = timeout(deadline, async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => outcome.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    outcome.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => outcome.exit_code = Some(exit_status),
                _ => {}
            }
        }
    })
    .await;
    outcome
}

#[tokio::test]
async fn none_auth_accepts_and_exec_runs() {
    let backend = Arc::new(loopback_backend());
    let srv = make_server(backend);
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    let auth = handle.authenticate_none("alice").await.unwrap();
    assert!(auth.success(), "identity-based none auth should succeed");

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "echo mesh-e2e-ok").await.unwrap();

    let outcome = drain_channel(&mut channel, Duration::from_secs(10)).await;
    let stdout = String::from_utf8_lossy(&outcome.stdout).to_string();
    assert!(stdout.contains("mesh-e2e-ok"), "stdout was: {stdout:?}");
    assert_eq!(outcome.exit_code, Some(0));
}

#[tokio::test]
async fn exec_exit_code_is_propagated() {
    let backend = Arc::new(loopback_backend());
    let srv = make_server(backend);
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    assert!(handle.authenticate_none("alice").await.unwrap().success());

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "exit 7").await.unwrap();
    let outcome = drain_channel(&mut channel, Duration::from_secs(10)).await;
    assert_eq!(outcome.exit_code, Some(7));
}

#[tokio::test]
async fn reject_policy_denies_transport_auth() {
    let backend = Arc::new(
        TestBackend::new()
            .with_peer("127.0.0.1", 7, "nPEER", "alice@ex.com")
            .with_policy(json!({
                "rules": [{
                    "principals": [{"any": true}],
                    "action": {"reject": true, "message": "nope"}
                }]
            })),
    );
    let srv = make_server(backend);
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    let accepted = handle
        .authenticate_none("alice")
        .await
        .map(|r| r.success())
        .unwrap_or(false);
    assert!(!accepted, "reject policy must deny");
}

#[tokio::test]
async fn policy_change_revokes_running_session() {
    let backend = Arc::new(loopback_backend());
    let srv = make_server(backend.clone());
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    assert!(handle.authenticate_none("alice").await.unwrap().success());

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 10").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The control plane withdraws access.
    backend.set_policy(json!({"rules": []}));
    srv.on_policy_change();

    let outcome = drain_channel(&mut channel, Duration::from_secs(10)).await;
    let stderr = String::from_utf8_lossy(&outcome.stderr).to_string();
    assert!(
        stderr.contains("Access revoked."),
        "stderr was: {stderr:?}"
    );
    assert!(outcome.exit_code.is_some(), "session must exit promptly");
    assert_eq!(srv.metrics.policy_change_kicks.get(), 1);
}

#[tokio::test]
async fn shutdown_kills_sessions_and_fences_new_connections() {
    let backend = Arc::new(loopback_backend());
    let srv = make_server(backend);
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    assert!(handle.authenticate_none("alice").await.unwrap().success());
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 30").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Shutdown must kill the sleeping child and drain, well under the
    // child's own runtime.
    timeout(Duration::from_secs(10), srv.shutdown())
        .await
        .expect("shutdown should drain sessions promptly");
    assert!(srv.is_shutdown());

    // Connection bookkeeping finishes just after the transport teardown.
    for _ in 0..50 {
        if srv.active_conn_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(srv.active_conn_count(), 0);

    // The fence refuses connections outright.
    let client_config = Arc::new(russh::client::Config::default());
    let refused = russh::client::connect(
        client_config,
        format!("127.0.0.1:{port}"),
        common::TestClientHandler,
    )
    .await;
    assert!(refused.is_err(), "post-shutdown connections must be denied");
}
