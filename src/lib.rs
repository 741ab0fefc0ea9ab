//! Plasma operator node: the transaction engine of a UTXO plasma chain
//!
//! This crate provides the operator side of a plasma chain featuring:
//! - Deposit and spend validation against indexed chain state
//! - Recoverable secp256k1 signatures with Ethereum-style addresses
//! - Merkle commitments and inclusion proofs for every block
//! - Atomic block packaging on a sled database
//! - A concurrent mempool with single-writer admission
//! - Block submission, confirmation and exit challenges against the base chain
//!
//! # Example
//!
//! ```no_run
//! use plasma_node::core::{Input, Output, Transaction, TransactionBody};
//! use plasma_node::crypto::KeyPair;
//! use plasma_node::rootchain::MemoryRootChain;
//! use plasma_node::storage::{SledStorage, Storage, StorageConfig};
//! use plasma_node::validation::validate_transaction;
//!
//! let storage = SledStorage::open(StorageConfig::default()).unwrap();
//! let root_chain = MemoryRootChain::new();
//!
//! // A deposit recorded by the base chain
//! let alice = KeyPair::generate();
//! root_chain.add_deposit(1u32, alice.address(), 100);
//!
//! // Claim it on the plasma chain
//! let mut tx = Transaction::new(TransactionBody {
//!     input0: Input::deposit(1u32),
//!     output0: Output::new(alice.address(), 100),
//!     ..Default::default()
//! });
//! tx.sign_input(0, &alice);
//! tx.sign_input(1, &alice);
//!
//! validate_transaction(&storage, &root_chain, &tx).unwrap();
//! let block = storage.package_block(&[tx]).unwrap();
//! println!("Packaged block {}", block.block_number);
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod node;
pub mod rootchain;
pub mod storage;
pub mod validation;

// Re-export commonly used types
pub use core::{
    Block, BlockResult, ConfirmedTransaction, Input, Output, Transaction, TransactionBody,
};
pub use crypto::{Address, KeyPair, MerkleProof, Signature};
pub use node::{MempoolHandle, Node, NodeConfig, TransactionConfirmer};
pub use rootchain::{MemoryRootChain, RootChain};
pub use storage::{SledStorage, Storage, StorageConfig};
pub use validation::ValidationError;
