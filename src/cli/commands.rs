//! CLI commands for the operator node
//!
//! Implements all command handlers for the CLI interface.

use crate::core::{Address, Hash};
use crate::crypto::KeyPair;
use crate::node::{MempoolConfig, Node, NodeConfig};
use crate::rootchain::MemoryRootChain;
use crate::storage::{Cursor, SledStorage, Storage, StorageConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Overrides applied to the node configuration by `start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub flush_interval_ms: Option<u64>,
    pub validation_workers: Option<usize>,
    pub capacity: Option<usize>,
}

impl StartOptions {
    /// Node configuration for `data_dir` with the overrides applied
    pub fn node_config(&self, data_dir: &Path) -> NodeConfig {
        let defaults = NodeConfig::default();
        let mempool_defaults = MempoolConfig::default();
        NodeConfig {
            flush_interval: self
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            storage: StorageConfig {
                data_dir: data_dir.to_path_buf(),
                ..Default::default()
            },
            mempool: MempoolConfig {
                capacity: self.capacity.unwrap_or(mempool_defaults.capacity),
                validation_workers: self
                    .validation_workers
                    .unwrap_or(mempool_defaults.validation_workers),
            },
            ..defaults
        }
    }
}

/// Open the chain database under `data_dir`
pub fn open_storage(data_dir: &Path) -> CliResult<SledStorage> {
    let storage = SledStorage::open(StorageConfig {
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    })?;
    Ok(storage)
}

fn short(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

/// Run the node until Ctrl-C
pub async fn cmd_start(data_dir: &PathBuf, options: &StartOptions) -> CliResult<()> {
    let config = options.node_config(data_dir);
    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(config.storage.clone())?);
    let root_chain = Arc::new(MemoryRootChain::new());

    println!("🚀 Starting operator node");
    println!("   📁 Data directory: {:?}", data_dir);
    println!("   ⏱️  Flush interval: {:?}", config.flush_interval);
    println!("   📦 Mempool capacity: {}", config.mempool.capacity);
    match storage.latest_block()? {
        Some(block) => println!("   🧱 Latest block: {}", block.number()),
        None => println!("   🧱 Latest block: none"),
    }
    println!("\n   Press Ctrl+C to stop\n");

    let node = Node::start(config, storage, root_chain)?;
    tokio::signal::ctrl_c().await?;
    node.shutdown().await?;

    println!("👋 Node stopped");
    Ok(())
}

/// Show chain and service status
pub fn cmd_status(storage: &dyn Storage) -> CliResult<()> {
    println!("📊 Chain Status");
    match storage.latest_block()? {
        Some(block) => {
            println!("   ├─ Latest block: {}", block.number());
            println!("   ├─ Block hash: 0x{}", hex::encode(block.block_hash));
            println!("   ├─ Merkle root: 0x{}", hex::encode(block.merkle_root()));
        }
        None => println!("   ├─ Latest block: none"),
    }
    println!(
        "   ├─ Last submitted block: {}",
        storage.cursor(Cursor::LastSubmittedBlock)?
    );
    println!(
        "   ├─ Deposit poll cursor: {}",
        storage.cursor(Cursor::DepositPoll)?
    );
    println!(
        "   ├─ Exit poll cursor: {}",
        storage.cursor(Cursor::TransactionExitPoll)?
    );
    println!(
        "   └─ Deposit exit poll cursor: {}",
        storage.cursor(Cursor::DepositExitPoll)?
    );
    Ok(())
}

/// Print a block with its metadata and transactions as JSON
pub fn cmd_block(storage: &dyn Storage, height: u64) -> CliResult<()> {
    match storage.full_block_at_height(height)? {
        Some(full) => println!("{}", serde_json::to_string_pretty(&full)?),
        None => println!("❌ Block {} not found", height),
    }
    Ok(())
}

/// Show the balance of an address
pub fn cmd_balance(storage: &dyn Storage, address: &str) -> CliResult<()> {
    let owner: Address = address.parse()?;
    let balance = storage.balance(&owner)?;
    let spendable = storage.spendable_outputs(&owner)?;

    println!("💰 Balance for {}", owner);
    println!("   Total: {}", balance);
    println!("   Spendable outputs: {}", spendable.len());
    Ok(())
}

/// List the unspent outputs of an address
pub fn cmd_utxos(storage: &dyn Storage, address: &str) -> CliResult<()> {
    let owner: Address = address.parse()?;
    let utxos = storage.utxos(&owner)?;

    if utxos.is_empty() {
        println!("📭 No unspent outputs for {}", owner);
        return Ok(());
    }

    println!("📋 Unspent outputs of {}", owner);
    for utxo in &utxos {
        println!(
            "   └─ {} ({}…) = {}",
            utxo.position,
            short(&utxo.tx_hash),
            utxo.output.amount
        );
    }
    Ok(())
}

/// Generate a fresh key pair
pub fn cmd_keygen() -> CliResult<()> {
    let key = KeyPair::generate();

    println!("🔐 New key generated!");
    println!("   📍 Address: {}", key.address());
    println!("   🔑 Private key: {}", key.private_key_hex());
    println!("\n   ⚠️  IMPORTANT: The private key is not stored anywhere.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_start_options_override_defaults() {
        let options = StartOptions {
            flush_interval_ms: Some(25),
            validation_workers: None,
            capacity: Some(10),
        };
        let config = options.node_config(Path::new("/tmp/chain"));

        assert_eq!(config.flush_interval, Duration::from_millis(25));
        assert_eq!(config.mempool.capacity, 10);
        assert_eq!(config.mempool.validation_workers, MempoolConfig::default().validation_workers);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/chain"));
        assert_eq!(config.submit_retry_delay, NodeConfig::default().submit_retry_delay);
    }

    #[test]
    fn test_queries_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(dir.path()).unwrap();
        let owner = KeyPair::generate().address().to_hex();

        cmd_status(&storage).unwrap();
        cmd_block(&storage, 1).unwrap();
        cmd_balance(&storage, &owner).unwrap();
        cmd_utxos(&storage, &owner).unwrap();
        assert!(cmd_balance(&storage, "not-an-address").is_err());
    }
}
