use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wsbridge", version, about = "Transparent WebSocket relay")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "wsbridge.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream WebSocket URL (overrides config file setting)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Allowed origin; repeat for several. Replaces the configured allowlist.
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    pub allow_origins: Vec<String>,

    /// Log level (overrides config file setting; RUST_LOG still wins)
    #[arg(long)]
    pub log_level: Option<String>,
}
