//! PTY session recording: with the recording knob set, a PTY session
//! produces a terminal-cast v2 file whose input events precede the echoed
//! output.
//!
//! Kept in its own test binary because the knob is process-global.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_client, current_username, make_server, start_test_server, TestBackend};
use russh::ChannelMsg;
use serde_json::json;
use tokio::time::timeout;

#[tokio::test]
async fn pty_session_is_recorded_as_cast_v2() {
    std::env::set_var("MESHSSH_DEBUG_LOG_SSH", "1");

    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        TestBackend::new()
            .with_peer("127.0.0.1", 7, "nPEER", "alice@ex.com")
            .with_policy(json!({
                "rules": [{
                    "sshUsers": {"alice": current_username()},
                    "principals": [{"userLogin": "alice@ex.com"}],
                    "action": {"accept": true}
                }]
            }))
            .with_var_root(tmp.path().to_path_buf()),
    );
    let srv = make_server(backend);
    let (port, _listener) = start_test_server(srv.clone()).await;

    let mut handle = connect_client(port).await;
    assert!(handle.authenticate_none("alice").await.unwrap().success());

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.exec(true, "cat").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    channel.data(&b"ls\n"[..]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    // ^D ends `cat` on a PTY.
    channel.data(&b"\x04"[..]).await.unwrap();

    let _ = timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { .. } = msg {
                break;
            }
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sessions_dir = tmp.path().join("ssh-sessions");
    let cast = std::fs::read_dir(&sessions_dir)
        .expect("recording directory created")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "cast"))
        .expect("a cast file exists");

    let content = std::fs::read_to_string(&cast).unwrap();
    let mut lines = content.lines();

    let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(header["version"], 2);
    assert_eq!(header["width"], 80);
    assert_eq!(header["height"], 24);
    assert_eq!(header["env"]["TERM"], "xterm-256color");

    let events: Vec<serde_json::Value> = lines
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(events.len() >= 2, "expected input and output events");

    let first_input = events.iter().position(|e| e[1] == "i");
    let first_output = events.iter().position(|e| e[1] == "o");
    let (Some(i), Some(o)) = (first_input, first_output) else {
        panic!("expected both input and output events, got {events:?}");
    };
    assert!(i < o, "input must be recorded before its echo");
    assert!(events[i][2].as_str().unwrap().contains("ls"));
}
