//! Environment knobs read at runtime rather than config-load time.
//!
//! The policy-file knobs are consulted on every evaluation so an operator
//! can swap policies under a live server; the debug knobs gate verbose
//! session tracing and PTY recording.

use std::path::PathBuf;

fn bool_env(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    )
}

/// `MESHSSH_DEBUG_SSH_VLOG`: verbose per-session tracing.
pub fn debug_ssh_vlog() -> bool {
    bool_env("MESHSSH_DEBUG_SSH_VLOG")
}

/// `MESHSSH_DEBUG_LOG_SSH`: record PTY sessions to the cast directory.
pub fn debug_log_ssh() -> bool {
    bool_env("MESHSSH_DEBUG_LOG_SSH")
}

/// `MESHSSH_POLICY_FILE`: JSON policy file overriding the netmap policy.
pub fn policy_file() -> Option<PathBuf> {
    std::env::var("MESHSSH_POLICY_FILE")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// `MESHSSH_IGNORE_MESH_POLICY`: ignore the netmap policy entirely,
/// forcing policy-file mode (or refusal when no file is set).
pub fn ignore_mesh_policy() -> bool {
    bool_env("MESHSSH_IGNORE_MESH_POLICY")
}
