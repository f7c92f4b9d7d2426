//! nodeflow - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeflow::util::config::{get_config_path, RuntimeConfig};
use nodeflow::util::logger::{self, LogLevel};
use nodeflow::{run_demo, NAME, VERSION};
use std::path::PathBuf;

/// Distributed memory coherence and task offload runtime
#[derive(Parser, Debug)]
#[command(name = "nodeflow")]
#[command(author = "nodeflow Team")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/nodeflow/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log: Option<LogLevel>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a round trip on an in-process cluster
    Demo {
        /// Number of nodes, master included
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Worker threads per node
        #[arg(short, long)]
        workers: Option<usize>,

        /// Bytes moved to the remote node and back
        #[arg(short, long, default_value_t = 64 * 1024)]
        bytes: usize,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config file as well
        #[arg(long)]
        save: bool,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?
        .with_env();
    if let Some(level) = args.log {
        config.log.level = level;
    }
    logger::try_init(config.log.level);

    if args.verbose {
        eprintln!("nodeflow version: {}", VERSION);
        eprintln!("Host: {}", std::env::consts::OS);
    }

    match args.command {
        Commands::Demo {
            nodes,
            workers,
            bytes,
        } => {
            if let Some(nodes) = nodes {
                config.cluster.nodes = nodes;
            }
            if let Some(workers) = workers {
                config.scheduler.workers = Some(workers);
            }
            let report = run_demo(&config, bytes).context("Demo failed")?;
            println!(
                "{} nodes, {} bytes, result {}",
                report.nodes,
                report.bytes,
                if report.verified { "verified" } else { "MISMATCH" }
            );
            if let Some(pe) = report.executed_by {
                println!("offloaded task ran on worker {}", pe);
            }
            for node in &report.traffic {
                println!(
                    "  {:<8} tx {:>10}  rx {:>10}  total {:>10}",
                    node.node.to_string(),
                    node.tx,
                    node.rx,
                    node.total()
                );
            }
            if !report.verified {
                anyhow::bail!("data read back does not match");
            }
        },
        Commands::Config { save } => {
            print!("{}", config.to_toml_string()?);
            if save {
                let path = args
                    .config
                    .or_else(get_config_path)
                    .context("Cannot determine config directory")?;
                config
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                eprintln!("saved to {}", path.display());
            }
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        },
    }

    Ok(())
}
