use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sshx_core::adapter::forward::ForwardState;
use sshx_core::adapter::proxy::ProxyState;
use sshx_core::adapter::stat::{render_table, render_tree};
use sshx_core::client::MuxClient;
use sshx_core::config::{Config, config_path};
use sshx_core::telemetry::{self, LogConfig, LogLevel};
use sshx_core::Node;
use sshx_proto::{Envelope, OperationCode, app};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sshx", about = "Peer-to-peer tunnels through NAT")]
struct Cli {
    /// Config file; defaults to $SSHX_HOME/.sshx_config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node.
    Daemon,
    /// List live tunnels.
    Stat {
        #[arg(long)]
        tree: bool,
    },
    /// Tear down a tunnel and everything spawned under it.
    Down {
        pair_id: String,
        #[arg(long = "app", default_value_t = app::SSH)]
        app_code: i32,
    },
    /// Open an ssh tunnel and pipe it through stdin/stdout.
    Connect { target: String },
    /// Bind stdin/stdout to an existing tunnel.
    Attach {
        pair_id: String,
        #[arg(long = "app", default_value_t = app::SSH)]
        app_code: i32,
    },
    /// Listen locally and forward every connection to the target's sshd.
    Proxy {
        target: String,
        #[arg(long)]
        port: u16,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    }
    .with_debug_env();
    if let Err(err) = telemetry::init(&log) {
        eprintln!("failed to initialize logging: {err}");
    }

    if let Err(err) = run(cli).await {
        error!("{err:#}");
        eprintln!("sshx: {err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = match cli.config {
        Some(path) => path,
        None => config_path().context("locating config file")?,
    };
    let config = Config::load_or_init(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let mux = MuxClient::local(config.local_tcp_port);

    match cli.command {
        Command::Daemon => {
            let node = Node::start(&config).await.context("starting node")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutting down");
            node.shutdown().await;
        }
        Command::Stat { tree } => {
            let stats = mux.stat().await.context("querying node")?;
            let rendered = if tree {
                render_tree(&stats)
            } else {
                render_table(&stats)
            };
            print!("{rendered}");
        }
        Command::Down { pair_id, app_code } => {
            mux.down(&pair_id, app_code)
                .await
                .with_context(|| format!("tearing down {pair_id}"))?;
        }
        Command::Connect { target } => {
            let payload = ForwardState::to(target.clone()).encode()?;
            let request = Envelope::request(app::SSH, OperationCode::Up).with_payload(payload);
            let (reply, stream) = mux
                .open(&request)
                .await
                .with_context(|| format!("connecting to {target}"))?;
            info!(pair_id = %reply.pair_id, "tunnel open");
            pipe_stdio(stream).await?;
        }
        Command::Attach { pair_id, app_code } => {
            let request = Envelope::request(app_code, OperationCode::Attach).with_pair_id(pair_id.clone());
            let (_, stream) = mux
                .open(&request)
                .await
                .with_context(|| format!("attaching to {pair_id}"))?;
            pipe_stdio(stream).await?;
        }
        Command::Proxy { target, port } => {
            let payload = ProxyState {
                host_id: target,
                listen_port: port,
            }
            .encode()?;
            let request = Envelope::request(app::PROXY, OperationCode::Up).with_payload(payload);
            mux.send_detached(request).await.context("requesting proxy")?;
            println!("proxy requested on 127.0.0.1:{port}; check `sshx stat`");
        }
        Command::Config => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

async fn pipe_stdio(stream: tokio::net::TcpStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let upstream = async {
        tokio::io::copy(&mut stdin, &mut writer).await?;
        writer.shutdown().await
    };
    let downstream = async {
        tokio::io::copy(&mut reader, &mut stdout).await?;
        stdout.flush().await
    };
    tokio::try_join!(upstream, downstream).context("piping tunnel")?;
    Ok(())
}
