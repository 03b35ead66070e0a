use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "cacheproxy",
    about = "HTTP forward proxy with an in-memory LRU response cache"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to accept proxy connections on.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Maximum concurrent client connections; 0 removes the limit.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Cache budget in megabytes; 0 removes the limit.
    #[arg(long)]
    pub max_cache_size: Option<u64>,

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
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}
