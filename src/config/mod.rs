pub mod env;
pub mod types;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &AppConfig) -> Result<()> {
    config
        .server
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("server.listen is not host:port: {}", config.server.listen))?;

    if config.server.overlay_cidrs.is_empty() {
        anyhow::bail!("server.overlay_cidrs must list at least one range");
    }

    if config.node.stable_id.is_empty() {
        anyhow::bail!("node.stable_id must not be empty");
    }

    let mut seen = std::collections::HashSet::new();
    for peer in &config.peers {
        if !seen.insert(peer.ip) {
            anyhow::bail!("duplicate peer overlay IP: {}", peer.ip);
        }
        if peer.login_name.is_empty() {
            anyhow::bail!("peer {} has an empty login_name", peer.ip);
        }
    }

    if let Some(doc) = &config.policy.document {
        serde_json::from_value::<crate::policy::SshPolicy>(doc.clone())
            .context("policy.document is not a valid policy")?;
    }

    if config.metrics.enabled {
        config
            .metrics
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("metrics.listen is not host:port: {}", config.metrics.listen))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
listen = "100.64.0.1:22"

[node]
id = 1
stable_id = "nSELF"
overlay_ip = "100.64.0.1"
"#;

    #[test]
    fn minimal_config_parses() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.server.listen, "100.64.0.1:22");
        assert_eq!(cfg.node.stable_id, "nSELF");
        assert_eq!(cfg.server.overlay_cidrs.len(), 2);
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn bad_listen_rejected() {
        let bad = MINIMAL.replace("100.64.0.1:22", "not-an-addr");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn duplicate_peer_ip_rejected() {
        let cfg = format!(
            "{MINIMAL}
[[peers]]
ip = \"100.64.0.2\"
node_id = 2
stable_id = \"nA\"
login_name = \"a@ex.com\"

[[peers]]
ip = \"100.64.0.2\"
node_id = 3
stable_id = \"nB\"
login_name = \"b@ex.com\"
"
        );
        assert!(parse_config(&cfg).is_err());
    }

    #[test]
    fn inline_policy_validated() {
        let cfg = format!(
            "{MINIMAL}
[policy]
document = {{ rules = [] }}
"
        );
        assert!(parse_config(&cfg).is_ok());
    }
}
