use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tarn::irc::config::Config;
use tarn::irc::server::Server;

/// A small IRC daemon.
#[derive(Debug, Parser)]
#[command(name = "tarnd", version)]
struct Opts {
    /// Path to the server configuration file.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let opts = Opts::parse();
    let config = Config::load(&opts.config)?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("tarnd listening on {}", listener.local_addr()?);

    Server::new(config).run(listener).await?;

    info!("server shutdown cleanly");
    Ok(())
}
