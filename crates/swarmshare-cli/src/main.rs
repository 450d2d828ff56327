use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use swarmshare_core::{DownloadProgress, JobState, Node, NodeConfig, NodeHandle, SearchResults};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmshare")]
#[command(about = "Search and swarm-download files shared by peers")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct NodeArgs {
    /// TOML config file; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    bind: Option<SocketAddr>,
    #[arg(long, global = true)]
    share_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    /// Peer to connect to at startup, as ip:port. Repeatable.
    #[arg(long = "peer", global = true)]
    peers: Vec<String>,
    /// How long to wait for search answers.
    #[arg(long, global = true, default_value_t = 5)]
    wait_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the share directory until interrupted.
    Start,
    /// Broadcast a search and print the grouped results.
    Search { term: String },
    /// Search for `term`, then download the result named `name`
    /// (defaults to `term`).
    Download {
        term: String,
        #[arg(long)]
        name: Option<String>,
    },
}

impl NodeArgs {
    fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_tcp = bind;
        }
        if let Some(dir) = &self.share_dir {
            config.share_dir = dir.clone();
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = Some(dir.clone());
        }
        config.bootstrap_peers.extend(self.peers.iter().cloned());
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(config: &NodeConfig) {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.node.load_config()?;
    init_tracing(&config);
    let wait = Duration::from_secs(cli.node.wait_secs);

    let node = Node::start(config).await?;
    println!("listening on {}", node.local_addr());

    let outcome = match cli.command {
        Command::Start => run_until_interrupted(&node).await,
        Command::Search { term } => {
            let results = node.search_and_wait(&term, wait).await?;
            print_results(&results);
            Ok(())
        }
        Command::Download { term, name } => {
            let name = name.unwrap_or_else(|| term.clone());
            download(&node, &term, &name, wait).await
        }
    };
    node.shutdown().await;
    outcome
}

async fn run_until_interrupted(node: &NodeHandle) -> anyhow::Result<()> {
    let peers = node.connected_peers().await;
    println!("connected to {} peer(s)", peers.len());
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    Ok(())
}

fn print_results(results: &SearchResults) {
    if results.is_empty() {
        println!("no results");
        return;
    }
    for (hash, group) in results {
        println!(
            "{}  {} bytes  {} block(s)  {}",
            group.descriptor.name,
            group.descriptor.size,
            group.descriptor.block_count(),
            hash
        );
        for peer in group.peers() {
            println!("    {peer}");
        }
    }
}

async fn download(
    node: &NodeHandle,
    term: &str,
    name: &str,
    wait: Duration,
) -> anyhow::Result<()> {
    let results = node.search_and_wait(term, wait).await?;
    print_results(&results);

    node.add_progress_listener(Arc::new(|progress: &DownloadProgress| {
        println!(
            "{}: {}/{} blocks ({}%)",
            progress.name, progress.completed, progress.total, progress.percent
        );
    }))
    .await;

    let job = node.start_download(name).await?;
    match job.wait().await {
        JobState::Done => {
            let elapsed = job.elapsed().await.unwrap_or_default();
            println!(
                "saved {} in {:.2}s",
                job.output_path().display(),
                elapsed.as_secs_f64()
            );
            for (peer, stats) in job.peer_stats().await {
                println!("    {peer}: {} block(s), {} bytes", stats.blocks, stats.bytes);
            }
            Ok(())
        }
        JobState::Failed(reason) => anyhow::bail!("download of {name} failed: {reason}"),
        other => anyhow::bail!("download of {name} ended in state {other:?}"),
    }
}
