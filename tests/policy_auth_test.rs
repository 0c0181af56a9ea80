//! Handshake policy tests, driving the connection handler directly:
//! identity-based accept, reject with banner, public-key steering, and the
//! `+password` workaround.

mod common;

use std::sync::Arc;

use common::{current_username, make_server, TestBackend};
use meshssh::conn::SshConnection;
use meshssh::policy::pub_key_matches_authorized_key;
use russh::keys::{Algorithm, PrivateKey, PublicKeyBase64};
use russh::server::{Auth, Handler};
use serde_json::json;

fn new_conn(srv: &Arc<meshssh::server::SshServer>) -> SshConnection {
    SshConnection::new(
        srv.clone(),
        "100.64.0.2:38022".parse().unwrap(),
        "100.64.0.1:22".parse().unwrap(),
    )
}

fn alice_backend() -> TestBackend {
    TestBackend::new().with_peer("100.64.0.2", 7, "nPEER", "alice@ex.com")
}

fn gen_client_key() -> (PrivateKey, russh::keys::PublicKey, String) {
    let private = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let public = private.public_key().clone();
    let line = format!(
        "{} {} test@host",
        public.algorithm().as_str(),
        public.public_key_base64()
    );
    (private, public, line)
}

fn rejected_without_methods(auth: &Auth) -> bool {
    matches!(
        auth,
        Auth::Reject {
            proceed_with_methods: None,
            ..
        }
    )
}

fn offered_methods(auth: &Auth) -> String {
    match auth {
        Auth::Reject {
            proceed_with_methods: Some(methods),
            ..
        } => format!("{methods:?}"),
        _ => String::new(),
    }
}

#[tokio::test]
async fn accept_by_user_login() {
    let local = current_username();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "sshUsers": {"alice": local},
            "principals": [{"userLogin": "alice@ex.com"}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(matches!(auth, Auth::Accept));

    let final_action = conn.shared.final_action().expect("terminal action set");
    assert!(final_action.accept);
    assert_eq!(conn.shared.local_account().unwrap().username, local);
    assert_eq!(conn.shared.info().unwrap().ssh_user, "alice");
}

#[tokio::test]
async fn reject_sends_banner_and_denies() {
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "principals": [{"any": true}],
            "action": {"reject": true, "message": "nope"}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(rejected_without_methods(&auth));
    assert!(conn.shared.queued_banners().contains(&"nope".to_string()));

    let final_action = conn.shared.final_action().unwrap();
    assert!(final_action.reject);
    let rejects = srv
        .metrics
        .terminal_action
        .get_or_create(&meshssh::metrics::ResultLabel {
            result: "reject".to_string(),
        })
        .get();
    assert_eq!(rejects, 1);
}

#[tokio::test]
async fn non_overlay_source_denied_before_policy() {
    let backend = Arc::new(
        TestBackend::new()
            .with_peer("192.168.1.5", 7, "nPEER", "alice@ex.com")
            .with_policy(json!({
                "rules": [{
                    "sshUsers": {"*": "="},
                    "principals": [{"any": true}],
                    "action": {"accept": true}
                }]
            })),
    );
    let srv = make_server(backend);
    let mut conn = SshConnection::new(
        srv.clone(),
        "192.168.1.5:40000".parse().unwrap(),
        "100.64.0.1:22".parse().unwrap(),
    );

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(rejected_without_methods(&auth));
    assert!(conn.shared.info().is_none());
    assert!(conn.shared.final_action().is_none());
}

#[tokio::test]
async fn unknown_peer_identity_denied() {
    // Overlay address, but the identity service has never heard of it.
    let backend = Arc::new(TestBackend::new().with_policy(json!({
        "rules": [{
            "sshUsers": {"*": "="},
            "principals": [{"any": true}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(rejected_without_methods(&auth));
}

#[tokio::test]
async fn no_policy_denies() {
    let backend = Arc::new(alice_backend());
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(rejected_without_methods(&auth));
}

#[tokio::test]
async fn expired_rule_is_skipped() {
    let local = current_username();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [
            {
                "ruleExpires": "2000-01-01T00:00:00Z",
                "sshUsers": {"alice": local},
                "principals": [{"any": true}],
                "action": {"accept": true}
            },
            {
                "principals": [{"any": true}],
                "action": {"reject": true}
            }
        ]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice").await.unwrap();
    assert!(rejected_without_methods(&auth));
    assert!(conn.shared.final_action().unwrap().reject);
}

#[tokio::test]
async fn pub_key_required_then_matching_key_accepts() {
    let local = current_username();
    let (_private, public, line) = gen_client_key();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "sshUsers": {"alice": local},
            "principals": [{"userLogin": "alice@ex.com", "pubKeys": [line]}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    // No key in hand: the handshake is steered toward public-key auth.
    let auth = conn.auth_none("alice").await.unwrap();
    assert!(offered_methods(&auth).contains("PublicKey"));

    let auth = conn.auth_publickey("alice", &public).await.unwrap();
    assert!(matches!(auth, Auth::Accept));
    assert_eq!(srv.metrics.publickey_accepts.get(), 1);
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let local = current_username();
    let (_, _, line) = gen_client_key();
    let (_, other_public, _) = gen_client_key();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "sshUsers": {"alice": local},
            "principals": [{"userLogin": "alice@ex.com", "pubKeys": [line]}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_publickey("alice", &other_public).await.unwrap();
    assert!(rejected_without_methods(&auth));
    assert_eq!(srv.metrics.publickey_accepts.get(), 0);
}

#[tokio::test]
async fn force_password_suffix_offers_password_and_accepts_any() {
    let local = current_username();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "sshUsers": {"alice": local},
            "principals": [{"userLogin": "alice@ex.com"}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_none("alice+password").await.unwrap();
    assert!(offered_methods(&auth).contains("Password"));
    // The suffix is a transport workaround, not part of the identity.
    assert_eq!(conn.shared.info().unwrap().ssh_user, "alice");

    let auth = conn
        .auth_password("alice+password", "anything-at-all")
        .await
        .unwrap();
    assert!(matches!(auth, Auth::Accept));
}

#[tokio::test]
async fn password_rejected_without_workaround() {
    let local = current_username();
    let backend = Arc::new(alice_backend().with_policy(json!({
        "rules": [{
            "sshUsers": {"alice": local},
            "principals": [{"userLogin": "alice@ex.com"}],
            "action": {"accept": true}
        }]
    })));
    let srv = make_server(backend);
    let mut conn = new_conn(&srv);

    let auth = conn.auth_password("alice", "guess").await.unwrap();
    assert!(rejected_without_methods(&auth));
}

#[test]
fn authorized_key_matching_with_real_key() {
    let (_, public, line) = gen_client_key();
    assert!(pub_key_matches_authorized_key(&public, &line));
    // Comment field is ignored.
    let no_comment = line.rsplit_once(' ').unwrap().0;
    assert!(pub_key_matches_authorized_key(&public, no_comment));

    let (_, other, _) = gen_client_key();
    assert!(!pub_key_matches_authorized_key(&other, &line));
    assert!(!pub_key_matches_authorized_key(&public, "ssh-ed25519"));
    assert!(!pub_key_matches_authorized_key(&public, "ssh-rsa AAAA"));
}
