use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Suffix on a requested SSH username that forces the server into the
/// password-method workaround for clients that mishandle a successful
/// `none` authentication.
pub const FORCE_PASSWORD_SUFFIX: &str = "+password";

/// Stable identifier of a peer node, assigned by the control plane.
/// Survives IP reassignment; compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StableNodeId(pub String);

impl fmt::Display for StableNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer node as reported by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    /// Numeric node ID used in delegate-URL expansion.
    pub id: i64,
    pub stable_id: StableNodeId,
}

/// The user profile attached to a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Login name, typically an email address (`alice@example.com`).
    pub login_name: String,
    #[serde(default)]
    pub display_name: String,
}

impl UserProfile {
    /// The part of the login name before `@`, or the whole name if it has
    /// no domain part.
    pub fn login_local_part(&self) -> &str {
        self.login_name
            .split_once('@')
            .map_or(self.login_name.as_str(), |(local, _)| local)
    }
}

/// Immutable facts about one SSH connection, established before policy
/// evaluation and never changed afterwards.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Requested SSH username with any `+password` suffix stripped.
    pub ssh_user: String,
    /// Overlay address and port the connection came from.
    pub src: SocketAddr,
    /// Overlay address and port the connection arrived on.
    pub dst: SocketAddr,
    pub node: PeerNode,
    pub user_profile: UserProfile,
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}@{}", self.src, self.ssh_user, self.dst)
    }
}

/// Address ranges that count as the overlay network. Connections whose
/// source or destination falls outside every range are rejected before
/// policy evaluation.
#[derive(Debug, Clone)]
pub struct OverlayRanges {
    nets: Vec<IpNet>,
}

impl OverlayRanges {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }
}

impl Default for OverlayRanges {
    fn default() -> Self {
        Self {
            nets: vec![
                "100.64.0.0/10".parse().expect("valid CGNAT range literal"),
                "fd7a:115c:a1e0::/48"
                    .parse()
                    .expect("valid overlay ULA range literal"),
            ],
        }
    }
}

/// Strip the `+password` workaround suffix from a requested username.
pub fn strip_force_password_suffix(requested: &str) -> (&str, bool) {
    match requested.strip_suffix(FORCE_PASSWORD_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (requested, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_default_ranges() {
        let ranges = OverlayRanges::default();
        assert!(ranges.contains("100.64.0.2".parse().unwrap()));
        assert!(ranges.contains("100.101.102.103".parse().unwrap()));
        assert!(!ranges.contains("192.168.1.10".parse().unwrap()));
        assert!(ranges.contains("fd7a:115c:a1e0::1".parse().unwrap()));
        assert!(!ranges.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn force_password_suffix_stripping() {
        assert_eq!(strip_force_password_suffix("alice"), ("alice", false));
        assert_eq!(
            strip_force_password_suffix("alice+password"),
            ("alice", true)
        );
        assert_eq!(strip_force_password_suffix("+password"), ("", true));
    }

    #[test]
    fn login_local_part() {
        let profile = UserProfile {
            login_name: "alice@example.com".into(),
            display_name: String::new(),
        };
        assert_eq!(profile.login_local_part(), "alice");

        let bare = UserProfile {
            login_name: "service-account".into(),
            display_name: String::new(),
        };
        assert_eq!(bare.login_local_part(), "service-account");
    }
}
