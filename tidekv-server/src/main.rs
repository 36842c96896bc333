use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tidekv_server::{Node, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tidekv-server", version, about = "TideKV key-value server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Start as a slave of `host:port`, overriding `replication.master`
    #[arg(long, value_name = "HOST:PORT")]
    slaveof: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, loaded) = if args.config.exists() {
        (ServerConfig::from_file(&args.config)?, true)
    } else {
        (ServerConfig::default(), false)
    };
    if let Some(master) = args.slaveof {
        config.replication.master = Some(master);
    }

    init_logging(&config);

    info!("Starting TideKV Server v{}", env!("CARGO_PKG_VERSION"));
    if loaded {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        warn!(
            "{} not found, using default configuration",
            args.config.display()
        );
    }

    let node = Node::start(&config).await?;

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    node.serve(listener, shutdown_signal()).await
}

/// Initialize tracing; `RUST_LOG` overrides the configured level
fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "pretty" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
