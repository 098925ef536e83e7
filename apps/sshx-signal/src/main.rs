use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use sshx_signal::Config;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sshx-signal", about = "Mailbox relay for sshx peer negotiation")]
struct Cli {
    /// Address to bind; the port comes from SSHX_SIGNALING_PORT unless --port is given.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    // RUST_LOG wins; otherwise SSHX_DEBUG picks the default level.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if config.debug { "debug" } else { "info" });
    }
    tracing_subscriber::fmt::init();

    if let Err(err) = run(&cli.host, config).await {
        error!("relay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(host: &str, config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{}", config.port)
        .parse()
        .with_context(|| format!("invalid bind address {host}:{}", config.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        %addr,
        pull_timeout = ?config.pull_timeout,
        mailbox_ttl = ?config.mailbox_ttl,
        queue_depth = config.queue_depth,
        "sshx-signal listening"
    );
    sshx_signal::serve(listener, &config)
        .await
        .context("relay server stopped")
}
