//! Core plasma chain components
//!
//! This module contains the value types every other layer passes around:
//! - Inputs, outputs and transactions (UTXO model, two in / two out)
//! - Confirmed transactions carrying owner confirmation signatures
//! - Blocks, block metadata and packaging results
//! - The canonical word encoding behind signature hashes

pub mod block;
pub mod encoding;
pub mod transaction;

pub use block::{Block, BlockHeader, BlockMetadata, BlockResult, FullBlock, FIRST_BLOCK_NUMBER};
pub use encoding::{WordEncoder, WORD_SIZE};
pub use transaction::{
    confirm_hash, ConfirmedTransaction, Input, Output, OutputPosition, Transaction,
    TransactionBody,
};

pub use crate::crypto::{Address, Hash, Signature};
