//! lt - expose a local port at a public URL

mod config;
mod logging;
mod run;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{Level, error};

#[derive(Parser, Debug)]
#[command(name = "lt")]
#[command(about = "Expose a local HTTP(S) service at a public URL")]
#[command(version)]
pub struct Cli {
    /// Internal HTTP server port
    #[arg(short = 'p', long, env = "LT_PORT", required_unless_present = "config")]
    port: Option<u16>,

    /// Upstream broker providing forwarding [default: https://localtunnel.me]
    #[arg(short = 'H', long, env = "LT_HOST")]
    host: Option<String>,

    /// Broker control port, when it differs from the scheme default
    #[arg(long, env = "LT_BROKER_PORT")]
    broker_port: Option<u16>,

    /// Request this subdomain
    #[arg(short = 's', long, env = "LT_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Tunnel traffic to this host instead of localhost, override Host header to this host
    #[arg(short = 'l', long, env = "LT_LOCAL_HOST")]
    local_host: Option<String>,

    /// Tunnel traffic to a local HTTPS server
    #[arg(long, env = "LT_LOCAL_HTTPS")]
    local_https: bool,

    /// Path to certificate PEM file for the local HTTPS server
    #[arg(long, env = "LT_LOCAL_CERT", requires = "local_key")]
    local_cert: Option<PathBuf>,

    /// Path to certificate key file for the local HTTPS server
    #[arg(long, env = "LT_LOCAL_KEY", requires = "local_cert")]
    local_key: Option<PathBuf>,

    /// Path to certificate authority file for self-signed certificates
    #[arg(long, env = "LT_LOCAL_CA")]
    local_ca: Option<PathBuf>,

    /// Disable certificate checks for the local HTTPS server (ignore cert/key/ca options)
    #[arg(long, env = "LT_ALLOW_INVALID_CERT")]
    allow_invalid_cert: bool,

    /// Print basic request info
    #[arg(long)]
    print_requests: bool,

    /// Tunnel configuration file (TOML or YAML); flags override its values
    #[arg(short = 'c', long, env = "LT_CONFIG")]
    config: Option<PathBuf>,

    /// Set logging level
    #[arg(long, env = "LT_LOG_LEVEL", default_value = "warn")]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, env = "LT_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    logging::init_logging(cli.log_level.clone().into(), cli.log_json, cli.log_file.as_deref())?;

    let config = match config::tunnel_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run::run(config, cli.print_requests).await {
        error!("Tunnel failed: {e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

#[derive(Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}
