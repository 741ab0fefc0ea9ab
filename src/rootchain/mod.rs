//! Base-chain client interface
//!
//! The plasma operator talks to a contract on the base chain to:
//! - look up deposits before they are spent inside the plasma chain
//! - publish the merkle root of every packaged block
//! - watch exits and challenge the fraudulent ones
//!
//! `MemoryRootChain` keeps all of that in process for development runs and tests.

pub mod memory;

use crate::core::{Address, BlockResult, ConfirmedTransaction, Hash, OutputPosition};
use num_bigint::{BigInt, BigUint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryRootChain;

/// Base-chain client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RootChainError {
    #[error("Base chain unavailable: {0}")]
    Unavailable(String),
    #[error("Base chain rejected the call: {0}")]
    Rejected(String),
}

/// A deposit recorded by the base-chain contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub nonce: BigUint,
    pub owner: Address,
    pub amount: BigInt,
    pub eth_block_number: u64,
}

/// An exit of a plasma output started on the base chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExit {
    pub position: OutputPosition,
    pub owner: Address,
    pub amount: BigInt,
    pub eth_block_number: u64,
    pub eth_tx_hash: Hash,
}

/// An exit of an unspent deposit started on the base chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedDepositExit {
    pub nonce: BigUint,
    pub owner: Address,
    pub amount: BigInt,
    pub eth_block_number: u64,
    pub eth_tx_hash: Hash,
}

/// What an exit claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitTarget {
    Output(OutputPosition),
    Deposit(BigUint),
}

/// Fraud proof against an exit: a recorded spend of the exited value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub target: ExitTarget,
    pub challenging_tx: ConfirmedTransaction,
    /// Merkle root of the block holding the challenging transaction
    pub merkle_root: Hash,
    /// Concatenated sibling hashes proving inclusion
    pub proof: Vec<u8>,
}

/// Calls made into the base chain
pub trait RootChain: Send + Sync {
    /// Deposit recorded under `nonce`, or `None` if the contract has none
    fn lookup_deposit(&self, nonce: &BigUint) -> Result<Option<Deposit>, RootChainError>;

    /// Deposits recorded in base-chain blocks `from..=to`, in block order
    fn deposits(&self, from: u64, to: u64) -> Result<Vec<Deposit>, RootChainError>;

    /// Publish a packaged block
    fn submit_block(&self, block: &BlockResult) -> Result<(), RootChainError>;

    /// Latest base-chain block number
    fn head_height(&self) -> Result<u64, RootChainError>;

    /// Output exits started in base-chain blocks `from..=to`
    fn started_exits(&self, from: u64, to: u64) -> Result<Vec<StartedExit>, RootChainError>;

    /// Deposit exits started in base-chain blocks `from..=to`
    fn started_deposit_exits(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<StartedDepositExit>, RootChainError>;

    fn challenge_exit(&self, challenge: &Challenge) -> Result<(), RootChainError>;
}
