use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use meshssh::cli::{Cli, Command};
use meshssh::config;
use meshssh::logging::setup_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = config::load_config(&cli.config)?;
            println!("Configuration is valid.");
            println!("  SSH listen: {}", cfg.server.listen);
            println!("  Node: {} ({})", cfg.node.stable_id, cfg.node.overlay_ip);
            println!("  Peers: {}", cfg.peers.len());
            return Ok(());
        }
        Some(Command::GenerateHostKey) => {
            let cfg = config::load_config(&cli.config)?;
            meshssh::server::load_or_generate_host_key(&cfg.server.host_key_path)?;
            println!("Host key ready at {}", cfg.server.host_key_path.display());
            return Ok(());
        }
        None => {}
    }

    let app_config = config::load_config(&cli.config)?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.to_string());
    setup_logging(&log_level, app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %app_config.server.listen,
        "Starting meshssh server"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = meshssh::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
