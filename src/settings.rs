use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::cache::DEFAULT_MAX_KEY_LENGTH;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_max_size_mb() -> u64 {
    64
}

fn default_cache_unbounded_responses() -> bool {
    true
}

fn default_cache_max_key_length() -> usize {
    DEFAULT_MAX_KEY_LENGTH
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Concurrent client connections; 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Cache budget in megabytes (2^20 bytes); 0 means unbounded.
    #[serde(default = "default_cache_max_size_mb")]
    pub cache_max_size_mb: u64,
    /// Cache responses whose length is not declared up front.
    #[serde(default = "default_cache_unbounded_responses")]
    pub cache_unbounded_responses: bool,
    #[serde(default = "default_cache_max_key_length")]
    pub cache_max_key_length: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log: default_log_format(),
            max_connections: 0,
            cache_enabled: default_cache_enabled(),
            cache_max_size_mb: default_cache_max_size_mb(),
            cache_unbounded_responses: default_cache_unbounded_responses(),
            cache_max_key_length: default_cache_max_key_length(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers, lowest precedence first: config file, `CACHEPROXY__*`
    /// environment variables, command-line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(config_path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHEPROXY")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("listen", cli.listen.map(|addr| addr.to_string()))
            .map_err(to_anyhow)?
            .set_override_option("max_connections", cli.max_connections.map(|n| n as u64))
            .map_err(to_anyhow)?
            .set_override_option("cache_max_size_mb", cli.max_cache_size)
            .map_err(to_anyhow)?
            .set_override_option("log", cli.log.map(|format| format.as_str()))
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        if self.cache_enabled {
            ensure!(
                self.cache_max_key_length > 0,
                "cache_max_key_length must be greater than 0 (got {})",
                self.cache_max_key_length
            );
            ensure!(
                self.cache_max_size_mb.checked_mul(1_048_576).is_some(),
                "cache_max_size_mb is too large (got {})",
                self.cache_max_size_mb
            );
        }
        if let Some(metrics) = self.metrics_listen {
            ensure!(
                metrics != self.listen,
                "metrics_listen must differ from listen (both {metrics})"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// An explicit `--config` must exist; the default location is optional.
fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    let candidate = PathBuf::from("cacheproxy.toml");
    candidate.exists().then_some(candidate)
}
