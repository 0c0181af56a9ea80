use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "meshssh",
    version,
    about = "Identity-aware SSH server for mesh-VPN nodes"
)]
pub struct Cli {
    /// Path to configuration file (also settable via MESHSSH_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "MESHSSH_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file
    CheckConfig,
    /// Generate the host key if it does not exist yet
    GenerateHostKey,
}
