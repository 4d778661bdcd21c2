use crate::backend::{BitcoindBackend, ChainBackend};
use crate::config::{Config, NetworkType};
use crate::topology::{Topology, TopologyEvent, TopologyService};
use anyhow::Context;
use clap::{Parser, Subcommand};
use daemonize::Daemonize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(name = "chainwatchd")]
#[command(about = "Chain topology and transaction watch daemon for a bitcoind backend")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Data directory (pid file, daemon logs, default config)")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the backend's chain until interrupted
    Start {
        #[arg(long, help = "Run in daemon mode")]
        daemon: bool,

        #[arg(long, help = "First block to track (rewind floor)")]
        first_block: Option<u32>,

        #[arg(long, help = "Poll interval in milliseconds")]
        poll_ms: Option<u64>,

        #[arg(long, help = "bitcoind RPC URL")]
        rpc_url: Option<String>,
    },

    /// Configuration file commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Print the backend's best block and fee estimate
    Tip,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a fresh configuration file for a network
    Init {
        #[arg(long, value_enum, default_value = "mainnet")]
        network: NetworkType,

        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

impl Cli {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Config::data_dir)
    }

    pub fn config_path(&self) -> PathBuf {
        match (&self.config, &self.data_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.join("config.json"),
            (None, None) => Config::config_path(),
        }
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self.command, Commands::Start { daemon: true, .. })
    }
}

pub fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).try_init();
}

/// Detach from the terminal. Must run before the tokio runtime exists.
pub fn daemonize(data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;

    let stdout = File::create(data_dir.join("chainwatchd.out"))?;
    let stderr = File::create(data_dir.join("chainwatchd.err"))?;

    Daemonize::new()
        .pid_file(data_dir.join("chainwatchd.pid"))
        .chown_pid_file(true)
        .working_directory(data_dir)
        .umask(0o027)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    log::info!("chainwatchd daemon started");
    Ok(())
}

pub async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();

    match cli.command {
        Commands::Start {
            first_block,
            poll_ms,
            rpc_url,
            ..
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(height) = first_block {
                config.topology.first_blocknum = height;
            }
            if let Some(ms) = poll_ms {
                config.topology.poll_interval_ms = ms;
            }
            if let Some(url) = rpc_url {
                config.bitcoind.rpc_url = url;
            }
            start_service(config).await
        }

        Commands::Config(cmd) => handle_config_command(&config_path, cmd),

        Commands::Tip => {
            let config = load_config(&config_path)?;
            show_tip(&config).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::load_from(path).with_context(|| format!("Failed to load {}", path.display()))
    } else {
        log::info!("No config at {}, using defaults", path.display());
        let config = Config::default();
        config.save_to(path)?;
        Ok(config)
    }
}

async fn start_service(config: Config) -> anyhow::Result<()> {
    println!("⛓️  chainwatchd starting on {:?}", config.network_type);
    println!("🔗 bitcoind RPC: {}", config.bitcoind.rpc_url);

    let backend = BitcoindBackend::new(&config.bitcoind, config.topology.fee_target_blocks)?;

    let mut topology = Topology::new();
    topology.setup(Arc::new(backend), config.topology.clone())?;

    let (service, _handle, mut events) = TopologyService::new(topology);

    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let result = service
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await;

    // The service owned the only event sender, so the logger drains and exits.
    let _ = logger.await;

    match result {
        Ok(()) => {
            println!("✅ chainwatchd stopped gracefully.");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Chain topology failed")),
    }
}

fn log_event(event: &TopologyEvent) {
    match event {
        TopologyEvent::BlockConnected { height, hash } => {
            log::debug!("Block {} connected at height {}", hash, height)
        }
        TopologyEvent::BlockDisconnected { height, hash } => {
            log::info!("Block {} disconnected from height {}", hash, height)
        }
        TopologyEvent::TopologyCorrupt { reason } => log::error!("Topology corrupt: {}", reason),
        other => match other.peer() {
            Some(peer) => log::info!("Event for {}: {:?}", peer, other),
            None => log::info!("{:?}", other),
        },
    }
}

fn handle_config_command(path: &Path, cmd: ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = if path.exists() {
                Config::load_from(path)?
            } else {
                println!("⚠️  {} does not exist, showing defaults", path.display());
                Config::default()
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        ConfigCommands::Init { network, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Config::for_network(network).save_to(path)?;
            println!("✅ Wrote {:?} configuration to {}", network, path.display());
        }
    }
    Ok(())
}

async fn show_tip(config: &Config) -> anyhow::Result<()> {
    let backend = BitcoindBackend::new(&config.bitcoind, config.topology.fee_target_blocks)?;

    let best = backend.best_block_hash().await?;
    let info = backend.block_header(&best).await?;
    println!("📦 Best block: {}", info.hash);
    println!("Height: {}", info.height);
    match chrono::DateTime::from_timestamp(info.timestamp() as i64, 0) {
        Some(time) => println!("Timestamp: {} ({})", info.timestamp(), time.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Timestamp: {}", info.timestamp()),
    }

    match backend.fee_estimate().await {
        Ok(rate) => println!("Fee estimate: {} sat/kvB ({} blocks)", rate, config.topology.fee_target_blocks),
        Err(e) => println!("Fee estimate unavailable: {}", e),
    }
    Ok(())
}
