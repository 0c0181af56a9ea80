//! SSH access policy: the document the control plane distributes and the
//! pure matching rules applied to it.
//!
//! A policy is an ordered list of rules. The first rule whose user mapping
//! and principals both match decides the connection's action. Matching that
//! requires network traffic (`https://` public-key lists) is driven by the
//! connection layer; everything in this module is side-effect free.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use russh::keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};

use crate::identity::{ConnInfo, StableNodeId, UserProfile};

/// Policy document, ordered most-specific first by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPolicy {
    #[serde(default)]
    pub rules: Vec<SshRule>,
}

/// One policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshRule {
    /// Rules past their expiry are skipped during evaluation.
    #[serde(default)]
    pub rule_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub principals: Vec<SshPrincipal>,
    /// Requested SSH user -> local user. `"*"` matches any requested name;
    /// the value `"="` maps to the requested name itself.
    #[serde(default, rename = "sshUsers")]
    pub ssh_users: HashMap<String, String>,
    #[serde(default)]
    pub action: Option<SshAction>,
}

/// Who a rule applies to. Identity predicates are OR-ed across principals;
/// within one principal, a non-empty `pub_keys` list must also match the
/// client's key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPrincipal {
    #[serde(default)]
    pub node: Option<StableNodeId>,
    #[serde(default, rename = "nodeIP")]
    pub node_ip: Option<String>,
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub any: bool,
    /// Authorized-key entries, or a single `https://` URL resolving to them.
    #[serde(default)]
    pub pub_keys: Vec<String>,
}

/// Outcome of a matched rule, or of one step of a delegation chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAction {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub accept: bool,
    /// Maximum session lifetime in seconds; 0 means unlimited.
    #[serde(default)]
    pub session_duration: u64,
    #[serde(default)]
    pub allow_agent_forwarding: bool,
    #[serde(default)]
    pub allow_local_port_forwarding: bool,
    /// URL to ask for the next action; empty on terminal actions.
    #[serde(default)]
    pub hold_and_delegate: String,
}

impl SshAction {
    /// Terminal actions end the chain; resolving past one is idempotent.
    pub fn is_terminal(&self) -> bool {
        self.accept || self.reject
    }

    pub fn accept() -> Self {
        Self {
            accept: true,
            ..Default::default()
        }
    }

    pub fn reject() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }
}

/// Map a requested SSH username through a rule's `ssh_users` table.
/// Returns the local username, or `""` when the rule does not cover the
/// requested name.
pub fn map_local_user(ssh_users: &HashMap<String, String>, requested: &str) -> String {
    let v = ssh_users
        .get(requested)
        .or_else(|| ssh_users.get("*"))
        .map(String::as_str)
        .unwrap_or("");
    if v == "=" {
        requested.to_string()
    } else {
        v.to_string()
    }
}

impl SshRule {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.rule_expires, Some(expiry) if expiry < now)
    }
}

/// Does the principal's identity predicate (node / node IP / user login /
/// any) match this connection? Public keys are not considered here.
pub fn principal_matches_identity(p: &SshPrincipal, info: &ConnInfo) -> bool {
    if p.any {
        return true;
    }
    if let Some(node) = &p.node {
        if !node.0.is_empty() && *node == info.node.stable_id {
            return true;
        }
    }
    if let Some(node_ip) = &p.node_ip {
        if let Ok(ip) = node_ip.parse::<std::net::IpAddr>() {
            if ip == info.src.ip() {
                return true;
            }
        }
    }
    if let Some(login) = &p.user_login {
        if !login.is_empty() && *login == info.user_profile.login_name {
            return true;
        }
    }
    false
}

/// Does a presented public key match one authorized-key line
/// (`<type> <base64> [comment]`)? The key type token must be equal and the
/// decoded base64 must equal the key's wire encoding; trailing fields are
/// ignored.
pub fn pub_key_matches_authorized_key(key: &russh::keys::PublicKey, want: &str) -> bool {
    let mut fields = want.split_whitespace();
    let (Some(want_type), Some(want_b64)) = (fields.next(), fields.next()) else {
        return false;
    };
    if key.algorithm().as_str() != want_type {
        return false;
    }
    let Ok(want_bytes) = base64::engine::general_purpose::STANDARD.decode(want_b64) else {
        return false;
    };
    let Ok(key_bytes) = base64::engine::general_purpose::STANDARD.decode(key.public_key_base64())
    else {
        return false;
    };
    !want_bytes.is_empty() && want_bytes == key_bytes
}

/// Expand the placeholders a public-key list URL may carry. URLs without
/// `$` pass through untouched.
pub fn expand_public_key_url(url: &str, profile: &UserProfile) -> String {
    if !url.contains('$') {
        return url.to_string();
    }
    url.replace("$LOGINNAME_EMAIL", &profile.login_name)
        .replace("$LOGINNAME_LOCALPART", profile.login_local_part())
}

/// Is there any unexpired rule that could admit this identity by public
/// key? Used after a failed `none`-method evaluation to decide whether to
/// steer the client toward public-key auth.
pub fn have_pub_key_policy(pol: &SshPolicy, info: &ConnInfo, now: DateTime<Utc>) -> bool {
    pol.rules.iter().any(|r| {
        !r.expired(now)
            && !map_local_user(&r.ssh_users, &info.ssh_user).is_empty()
            && r.principals
                .iter()
                .any(|p| !p.pub_keys.is_empty() && principal_matches_identity(p, info))
    })
}
