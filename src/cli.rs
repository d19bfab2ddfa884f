use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "cacheproxy",
    about = "Caching reverse proxy that persists origin responses on disk",
    override_usage = "cacheproxy [OPTIONS] [LISTEN_PORT] [ORIGIN_URL]"
)]
pub struct Cli {
    /// Port to listen on (all interfaces). Overrides `listen` from the configuration.
    pub port: Option<u16>,

    /// Base URL of the origin server, e.g. https://api.example.com
    pub origin: Option<String>,

    /// Path to the configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding cached entries.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_port_and_origin() {
        let cli = Cli::parse_from(["cacheproxy", "8080", "https://api.example.com"]);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.origin.as_deref(), Some("https://api.example.com"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn parses_flags_without_positionals() {
        let cli = Cli::parse_from([
            "cacheproxy",
            "--config",
            "/etc/cacheproxy.toml",
            "--log",
            "json",
        ]);
        assert_eq!(cli.port, None);
        assert_eq!(cli.log, Some(LogFormat::Json));
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/cacheproxy.toml"))
        );
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Cli::try_parse_from(["cacheproxy", "http", "https://api.example.com"]).is_err());
    }
}
