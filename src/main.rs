//! Plasma Operator Node CLI
//!
//! A command-line interface for running and inspecting the operator node.

use clap::{Parser, Subcommand};
use plasma_node::cli::{self, StartOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "plasma")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Operator node for a UTXO plasma chain", long_about = None)]
struct Cli {
    /// Data directory for chain storage
    #[arg(short, long, default_value = ".plasma_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the operator node against an in-memory base chain
    Start {
        /// Period of the packaging loop in milliseconds
        #[arg(long)]
        flush_interval_ms: Option<u64>,

        /// Number of concurrent transaction validations
        #[arg(long)]
        validation_workers: Option<usize>,

        /// Maximum number of pending transactions
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Show chain and service status
    Status,

    /// Print a block as JSON
    Block {
        /// Block number
        #[arg(long)]
        height: u64,
    },

    /// Show the balance of an address
    Balance {
        /// Owner address (0x-prefixed hex)
        #[arg(short, long)]
        address: String,
    },

    /// List the unspent outputs of an address
    Utxos {
        /// Owner address (0x-prefixed hex)
        #[arg(short, long)]
        address: String,
    },

    /// Generate a new key pair
    Keygen,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            flush_interval_ms,
            validation_workers,
            capacity,
        } => {
            let options = StartOptions {
                flush_interval_ms,
                validation_workers,
                capacity,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cli::cmd_start(&cli.data_dir, &options))?;
        }

        Commands::Keygen => cli::cmd_keygen()?,

        Commands::Status => {
            let storage = cli::open_storage(&cli.data_dir)?;
            cli::cmd_status(&storage)?;
        }

        Commands::Block { height } => {
            let storage = cli::open_storage(&cli.data_dir)?;
            cli::cmd_block(&storage, height)?;
        }

        Commands::Balance { address } => {
            let storage = cli::open_storage(&cli.data_dir)?;
            cli::cmd_balance(&storage, &address)?;
        }

        Commands::Utxos { address } => {
            let storage = cli::open_storage(&cli.data_dir)?;
            cli::cmd_utxos(&storage, &address)?;
        }
    }

    Ok(())
}
