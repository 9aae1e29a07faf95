use std::path::PathBuf;

use clap::Parser;
use relay::RelayServer;
use relay_config::RelayConfig;
use tracing_subscriber::EnvFilter;

/// Relay daemon: multiplexes CLI client requests to registered editor instances.
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug-level logging regardless of configured log level.
    #[arg(long)]
    debug: bool,

    /// Load configuration from this file instead of the standard search path.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.listen.host = host;
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if args.debug {
        config.telemetry.log_level = "debug".to_string();
    }

    let filter = EnvFilter::try_new(&config.telemetry.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = RelayServer::new(config);
    server.spawn_signal_handler();
    server.run().await
}
