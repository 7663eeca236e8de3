use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub origins: OriginsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_upstream")]
    pub upstream_url: String,
    #[serde(default = "default_route")]
    pub route_path: String,
    /// Seconds allowed for the upstream handshake. `0` disables the limit.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Seconds a direction may stay silent before the session ends. Unset
    /// or `0` means no idle limit.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            upstream_url: default_upstream(),
            route_path: default_route(),
            dial_timeout_secs: default_dial_timeout(),
            idle_timeout_secs: None,
        }
    }
}

impl NetworkConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        non_zero_secs(Some(self.dial_timeout_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct OriginsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed: Vec<String>,
}

impl Default for OriginsConfig {
    fn default() -> Self {
        Self {
            allowed: default_allowed_origins(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// JSON-lines session event log. Disabled when unset.
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            audit_log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream() -> String {
    ws_relay::DEFAULT_UPSTREAM.to_string()
}

fn default_route() -> String {
    ws_relay::DEFAULT_ROUTE.to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn non_zero_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Where the configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file does not exist; built-in defaults are in use.
    Defaults,
}

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration. Logging is usually not
/// set up yet when this runs, so the caller reports the [`ConfigSource`].
pub fn load(path: &Path) -> anyhow::Result<(Config, ConfigSource)> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config = from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok((config, ConfigSource::File))
}

pub fn from_str(yaml: &str) -> anyhow::Result<Config> {
    if yaml.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yml::from_str(yaml)?)
}

impl Config {
    /// Apply command-line overrides on top of the file settings.
    pub fn merge_cli(&mut self, cli: &Cli) {
        if let Some(ref listen) = cli.listen {
            self.network.listen_addr = listen.clone();
        }
        if let Some(ref upstream) = cli.upstream {
            self.network.upstream_url = upstream.clone();
        }
        if !cli.allow_origins.is_empty() {
            self.origins.allowed = cli.allow_origins.clone();
        }
        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }
    }
}
