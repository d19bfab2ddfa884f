use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::origin::Origin;

const ENV_PREFIX: &str = "CACHEPROXY";
const DEFAULT_CONFIG_FILE: &str = "cacheproxy.toml";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_queries() -> bool {
    false
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

fn default_upstream_pool_capacity() -> usize {
    32
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_cache_max_entry_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub origin: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_log_queries")]
    pub log_queries: bool,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_upstream_pool_capacity")]
    pub upstream_pool_capacity: usize,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: usize,
}

impl Settings {
    /// Layers the optional configuration file, `CACHEPROXY__*` environment variables and
    /// command-line arguments, in increasing order of precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("listen", cli.port.map(|port| format!("0.0.0.0:{port}")))
            .map_err(to_anyhow)?
            .set_override_option("origin", cli.origin.clone())
            .map_err(to_anyhow)?
            .set_override_option(
                "cache_dir",
                cli.cache_dir
                    .as_ref()
                    .map(|path| path.display().to_string()),
            )
            .map_err(to_anyhow)?
            .set_override_option("log", cli.log.map(|format| format.as_str()))
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg
            .try_deserialize()
            .map_err(to_anyhow)
            .context("invalid configuration (an origin URL is required)")?;
        // CLI paths are relative to the working directory; file paths to the file.
        if cli.cache_dir.is_none()
            && let Some(path) = &config_path
        {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn origin(&self) -> Result<Origin> {
        Origin::parse(&self.origin).with_context(|| "invalid origin URL".to_string())
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

    pub fn upstream_pool_capacity_nonzero(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.upstream_pool_capacity)
            .context("upstream_pool_capacity must be at least 1")
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        self.origin()?;
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        ensure!(
            self.upstream_pool_capacity > 0,
            "upstream_pool_capacity must be at least 1 (got {})",
            self.upstream_pool_capacity
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.cache_max_entry_size > 0,
            "cache_max_entry_size must be greater than 0 (got {})",
            self.cache_max_entry_size
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
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(path) = cli.config.as_deref() {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(candidate.exists().then_some(candidate))
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
