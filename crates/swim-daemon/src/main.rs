//! swim-daemon: one SWIM group member per process, or the status aggregator.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use swim_core::{DatagramTransport, Node};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swim_daemon::aggregator::{self, Aggregator};
use swim_daemon::{AggregatorArgs, NodeArgs, NodeRuntime, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "swim-daemon")]
#[command(about = "SWIM group membership with NAT relaying")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a group member
    Node(NodeArgs),
    /// Collect status reports and measure convergence
    Aggregator(AggregatorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,swim_daemon=debug,swim_core=debug"
    } else {
        "info,swim_daemon=info,swim_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Node(args) => run_node(args).await,
        Command::Aggregator(args) => run_aggregator(args).await,
    }
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let transport = Arc::new(UdpTransport::bind(args.listen).await?);
    let config = args.node_config(transport.local_addr()?)?;
    info!("Starting node {}", config.address);

    let node = Node::new(config, Box::new(args.sampler()));
    let (handle, task) = NodeRuntime::spawn(node, transport);

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_handle.shutdown();
        }
    });

    info!("Node running. Press Ctrl+C to stop.");
    task.await??;
    Ok(())
}

async fn run_aggregator(args: AggregatorArgs) -> Result<()> {
    let transport = Arc::new(UdpTransport::bind(args.listen).await?);
    let aggregator = Aggregator::new(args.staleness()?);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    info!("Aggregator running. Press Ctrl+C to stop.");
    let aggregator = aggregator::serve(
        transport,
        aggregator,
        args.summary_interval()?,
        args.json,
        shutdown_rx,
    )
    .await?;

    let summary = aggregator.summary(std::time::Instant::now());
    info!("Final summary: {}", serde_json::to_string(&summary)?);
    Ok(())
}
