//! Cryptographic utilities for the plasma chain
//!
//! This module provides:
//! - Keccak-256, SHA-256 and SHA3-256 hashing
//! - Recoverable ECDSA signatures (secp256k1) with Ethereum addresses
//! - Merkle root and inclusion proof calculations

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{
    eth_signed_message_hash, hash_from_hex, hex_bytes, keccak256, keccak256_concat, sha256,
    sha3_256, Hash, ZERO_HASH,
};
pub use keys::{
    public_key_to_address, recover_address, sign_hash, verify_signature, Address, KeyError,
    KeyPair, Signature,
};
pub use merkle::{calculate_merkle_root, empty_root, merkle_root_and_proof, MerkleProof};
