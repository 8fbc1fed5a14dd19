use std::path::PathBuf;
use std::time::Duration;

use alicia_hub::client::HubClient;
use alicia_hub::protocol::Subscribe;
use alicia_hub::server::{HubServer, ServerConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "alicia-server",
    about = "Real-time hub for conversation clients, agent, voice and assistant workers"
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every frame the hub routes.
    Monitor(MonitorArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Interface to listen on.
    #[arg(long, env = "ALICIA_SERVER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "ALICIA_SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Shared secret for agent, voice and assistant connections.
    /// Unset means open mode.
    #[arg(long, env = "ALICIA_AGENT_SECRET", hide_env_values = true)]
    agent_secret: Option<String>,

    /// RocksDB directory. Conversations are kept in memory when unset.
    #[arg(long, env = "ALICIA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Deadline for each outbound write.
    #[arg(long, default_value_t = 10)]
    write_timeout_secs: u64,

    /// Ceiling on processing one inbound frame.
    #[arg(long, default_value_t = 300)]
    process_timeout_secs: u64,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            agent_secret: self.agent_secret.filter(|s| !s.is_empty()),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            process_timeout: Duration::from_secs(self.process_timeout_secs),
            storage_path: self.data_dir,
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Hub WebSocket URL.
    #[arg(long, env = "ALICIA_SERVER_URL", default_value = "ws://127.0.0.1:8080")]
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Some(Command::Monitor(args)) => monitor(args).await,
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config();
    if config.agent_secret.is_none() {
        warn!("No agent secret configured, privileged roles are open");
    }
    match &config.storage_path {
        Some(path) => info!("Persisting conversations to {}", path.display()),
        None => info!("No data directory set, conversations are kept in memory"),
    }

    let server = HubServer::open(config)
        .await
        .context("Failed to start hub server")?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await.context("Hub server failed")?;

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} frames in",
        stats.total_connections, stats.frames_received
    );
    Ok(())
}

async fn monitor(args: MonitorArgs) -> Result<()> {
    let mut client = HubClient::connect(&args.url, None)
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let ack = client
        .subscribe(Subscribe::monitor())
        .await
        .context("Monitor subscribe failed")?;
    if !ack.success {
        anyhow::bail!(
            "Hub rejected monitor subscription: {}",
            ack.error.unwrap_or_default()
        );
    }
    info!("Monitoring {}", args.url);

    loop {
        tokio::select! {
            frame = client.recv_monitor_frame() => {
                let frame = frame.context("Monitor connection closed")?;
                match frame.envelope() {
                    Ok(envelope) => println!(
                        "{:>9} -> {:<9} {:<24} conv={} {}B",
                        frame.src,
                        frame.dst,
                        envelope.msg_type.to_string(),
                        envelope.conversation_id,
                        frame.data.len()
                    ),
                    Err(e) => println!(
                        "{:>9} -> {:<9} <undecodable: {e}> {}B",
                        frame.src,
                        frame.dst,
                        frame.data.len()
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Monitor stopped");
                return Ok(());
            }
        }
    }
}
