//! Block implementation for the plasma chain
//!
//! A block header commits to the merkle root of its transactions and to the
//! previous block. Metadata such as fees and creation time is stored next to
//! the block but is not hashed.

use crate::core::transaction::ConfirmedTransaction;
use crate::crypto::{hex_bytes, sha3_256, Hash};
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// Number of the first block of the chain
pub const FIRST_BLOCK_NUMBER: u64 = 1;

/// Block header containing the commitments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Merkle root of the block's transaction hashes
    #[serde(with = "hex_bytes")]
    pub merkle_root: Hash,
    /// Hash of the previous block, zero for block 1
    #[serde(with = "hex_bytes")]
    pub prev_hash: Hash,
    pub number: u64,
}

impl BlockHeader {
    /// `sha3_256(merkle_root || prev_hash || number)`, number as big-endian u64
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(32 + 32 + 8);
        data.extend_from_slice(&self.merkle_root);
        data.extend_from_slice(&self.prev_hash);
        data.extend_from_slice(&self.number.to_be_bytes());
        sha3_256(&data)
    }
}

/// A block of the plasma chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    #[serde(with = "hex_bytes")]
    pub block_hash: Hash,
}

impl Block {
    /// Create a block and compute its hash
    pub fn new(merkle_root: Hash, prev_hash: Hash, number: u64) -> Self {
        let header = BlockHeader {
            merkle_root,
            prev_hash,
            number,
        };
        let block_hash = header.hash();
        Self { header, block_hash }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn merkle_root(&self) -> &Hash {
        &self.header.merkle_root
    }

    /// Check that the stored hash matches the header
    pub fn has_valid_hash(&self) -> bool {
        self.block_hash == self.header.hash()
    }
}

/// Bookkeeping stored next to a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    pub created_at: DateTime<Utc>,
    pub transaction_count: u32,
    pub fees: BigInt,
}

impl BlockMetadata {
    pub fn new(transaction_count: u32, fees: BigInt) -> Self {
        Self {
            created_at: Utc::now(),
            transaction_count,
            fees,
        }
    }
}

/// Outcome of packaging, everything the base-chain contract needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    #[serde(with = "hex_bytes")]
    pub merkle_root: Hash,
    pub number_of_transactions: u32,
    pub block_fees: BigInt,
    pub block_number: u64,
}

/// A block with its metadata and transactions in index order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullBlock {
    pub block: Block,
    pub metadata: BlockMetadata,
    pub transactions: Vec<ConfirmedTransaction>,
}
