//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Authorization gateway for a private Go module proxy
///
/// Admits GitHub Actions jobs whose OIDC token names the repository of the
/// requested module, plus any caller on the bypass list.
#[derive(Parser, Debug)]
#[command(name = "gha-goproxy-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GHA_GOPROXY_GATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides PORT and the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GHA_GOPROXY_GATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format
    #[arg(
        long,
        default_value = "json",
        env = "GHA_GOPROXY_GATE_LOG_FORMAT",
        value_parser = ["text", "json"]
    )]
    pub log_format: String,
}
