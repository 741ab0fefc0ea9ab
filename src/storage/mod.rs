//! Storage module: the indexed chain database
//!
//! The store is the single source of truth for committed chain state:
//! - transactions by hash and by (block, index)
//! - unspent outputs by (owner, tx hash, output index)
//! - spends, exits and consumed deposits, the double-spend index
//! - blocks, block metadata and the latest block pointer
//! - persistent poll cursors of the node services
//!
//! Lookups return `Ok(None)` when a key is absent; `Err` is reserved for
//! infrastructure failures.

pub mod keys;
pub mod sled_store;

use crate::core::{
    Address, Block, BlockMetadata, BlockResult, ConfirmedTransaction, FullBlock, Hash, Input,
    Output, OutputPosition, Signature, Transaction,
};
use crate::crypto::hex_bytes;
use num_bigint::{BigInt, BigUint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use sled_store::SledStorage;

// =============================================================================
// Error Types
// =============================================================================

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Cannot package an empty batch")]
    EmptyBatch,
    #[error("Batch of {0} transactions does not fit in a block")]
    BatchTooLarge(usize),
    #[error("Latest block moved during packaging: expected {expected:?}, found {found:?}")]
    BlockRace {
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("Block {got} does not follow latest block {latest:?}")]
    NonSequentialBlock { latest: Option<u64>, got: u64 },
    #[error("Block {0} does not link to the latest block hash")]
    PrevHashMismatch(u64),
    #[error("Output {0} referenced by the batch does not exist")]
    MissingInput(OutputPosition),
    #[error("Output {0} is already spent or exited")]
    DoubleSpend(OutputPosition),
    #[error("Deposit {0} is already consumed")]
    DepositConsumed(BigUint),
    #[error("Transaction {block}:{index} not found")]
    TransactionNotFound { block: u64, index: u32 },
    #[error("Transaction {block}:{index} is already confirmed")]
    AlreadyConfirmed { block: u64, index: u32 },
    #[error("Confirmation carries no signatures")]
    EmptyConfirmation,
    #[error("Storage task interrupted: {0}")]
    Interrupted(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Flush to disk after every committed write group
    pub flush_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".plasma_data"),
            flush_on_commit: true,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Persistent counters of the node services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Highest block number acknowledged by the base chain
    LastSubmittedBlock,
    /// Base-chain block up to which deposits were polled
    DepositPoll,
    /// Base-chain block up to which output exits were processed
    TransactionExitPoll,
    /// Base-chain block up to which deposit exits were processed
    DepositExitPoll,
}

impl Cursor {
    pub fn name(&self) -> &'static str {
        match self {
            Cursor::LastSubmittedBlock => "LAST_SUBMITTED_BLOCK",
            Cursor::DepositPoll => "LATEST_DEPOSIT_IDX",
            Cursor::TransactionExitPoll => "LATEST_TRANSACTION_EXIT_IDX",
            Cursor::DepositExitPoll => "LATEST_DEPOSIT_EXIT_IDX",
        }
    }
}

/// An unspent output and where it lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub position: OutputPosition,
    #[serde(with = "hex_bytes")]
    pub tx_hash: Hash,
    pub output: Output,
}

/// Where on the base chain an exit was filed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitLocator {
    /// The exited output, or the exited deposit
    pub exited: Input,
    pub eth_block_number: u64,
    #[serde(with = "hex_bytes")]
    pub eth_tx_hash: Hash,
}

// =============================================================================
// Storage Interface
// =============================================================================

/// Indexed chain state
pub trait Storage: Send + Sync {
    /// Assign positions to `txs`, build the next block and commit every index
    /// update of the batch as one atomic group
    fn package_block(&self, txs: &[Transaction]) -> Result<BlockResult, StorageError>;

    /// Adopt a block produced elsewhere; it must extend the latest block
    fn insert_block(
        &self,
        block: &Block,
        metadata: &BlockMetadata,
        txs: &[ConfirmedTransaction],
    ) -> Result<(), StorageError>;

    /// Attach confirmation signatures, once, to a packaged transaction
    fn confirm_transaction(
        &self,
        block_number: u64,
        transaction_index: u32,
        sigs: [Signature; 2],
    ) -> Result<ConfirmedTransaction, StorageError>;

    /// Record an exit of an output and drop it from the UTXO set
    fn mark_as_exited(
        &self,
        position: &OutputPosition,
        eth_block_number: u64,
        eth_tx_hash: &Hash,
    ) -> Result<(), StorageError>;

    /// Record an exit of a deposit so it can no longer be consumed
    fn mark_deposit_as_exited(
        &self,
        nonce: &BigUint,
        eth_block_number: u64,
        eth_tx_hash: &Hash,
    ) -> Result<(), StorageError>;

    /// True if any input of `tx` was already spent, exited or consumed
    fn is_double_spent(&self, tx: &Transaction) -> Result<bool, StorageError>;

    /// The transaction that spent the output at `position`
    fn find_double_spending_transaction(
        &self,
        position: &OutputPosition,
    ) -> Result<Option<ConfirmedTransaction>, StorageError>;

    /// The transaction that consumed deposit `nonce`
    fn find_double_spending_deposit(
        &self,
        nonce: &BigUint,
    ) -> Result<Option<ConfirmedTransaction>, StorageError>;

    fn exit_at(&self, position: &OutputPosition) -> Result<Option<ExitLocator>, StorageError>;

    fn find_transaction(
        &self,
        block_number: u64,
        transaction_index: u32,
    ) -> Result<Option<ConfirmedTransaction>, StorageError>;

    fn find_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<ConfirmedTransaction>, StorageError>;

    /// All transactions of a block in index order
    fn find_transactions_by_block(
        &self,
        block_number: u64,
    ) -> Result<Vec<ConfirmedTransaction>, StorageError>;

    fn latest_block(&self) -> Result<Option<Block>, StorageError>;

    fn block_at_height(&self, number: u64) -> Result<Option<Block>, StorageError>;

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError>;

    fn block_meta_at_height(&self, number: u64) -> Result<Option<BlockMetadata>, StorageError>;

    /// Block, metadata and transactions read from one consistent state
    fn full_block_at_height(&self, number: u64) -> Result<Option<FullBlock>, StorageError>;

    /// Every unspent output of `owner`, ordered by position
    fn utxos(&self, owner: &Address) -> Result<Vec<Utxo>, StorageError>;

    /// Unspent outputs whose creating transaction has been confirmed
    fn spendable_outputs(&self, owner: &Address) -> Result<Vec<Utxo>, StorageError>;

    /// Sum of the unspent outputs of `owner`
    fn balance(&self, owner: &Address) -> Result<BigInt, StorageError> {
        Ok(self
            .utxos(owner)?
            .iter()
            .fold(BigInt::default(), |acc, utxo| acc + &utxo.output.amount))
    }

    /// Stored cursor value, zero when never saved
    fn cursor(&self, cursor: Cursor) -> Result<u64, StorageError>;

    fn save_cursor(&self, cursor: Cursor, value: u64) -> Result<(), StorageError>;
}
