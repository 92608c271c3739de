//! TLS echo server built on Moat.
//!
//! ```text
//! echo-server --config echo-server.toml
//! echo-server --port 9443 --credentials certs/
//! RUST_LOG=moat=debug,moat::wire=trace echo-server
//! ```

mod config;

use std::path::PathBuf;

use clap::Parser;
use moat::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "Multi-threaded TLS echo server", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory with certificate.pem and private_key.pem, overriding the
    /// configuration file.
    #[arg(long)]
    credentials: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moat=info,echo_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = cli.credentials {
        config.credentials_dir = dir;
    }

    tracing::info!(
        port = config.port,
        workers = config.worker_threads,
        max_connections = config.max_connections,
        credentials = %config.credentials_dir.display(),
        "configuration loaded"
    );

    let mut server = Server::new(config);
    server.start()?;

    // The server runs on its own pool; this thread only waits for Ctrl-C.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    tracing::info!("received Ctrl-C");
    server.shutdown()?;
    Ok(())
}
