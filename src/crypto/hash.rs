//! Hashing primitives for the plasma chain
//!
//! Three digests are in play:
//! - Keccak-256 for signature hashes, transaction hashes and addresses
//! - SHA-256 for merkle inner nodes
//! - SHA3-256 for block hashes

use sha2::Sha256;
use sha3::{Digest, Keccak256, Sha3_256};

/// A 32 byte digest
pub type Hash = [u8; 32];

/// The all-zero digest, used as the previous hash of block 1
pub const ZERO_HASH: Hash = [0u8; 32];

/// Prefix prepended by Ethereum wallets before signing a 32 byte hash
const SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Computes the legacy Keccak-256 digest of the input
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes Keccak-256 over several slices without concatenating them first
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes FIPS-202 SHA3-256 of the input data
pub fn sha3_256(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash actually signed by a wallet: keccak256 of the prefixed message
pub fn eth_signed_message_hash(hash: &Hash) -> Hash {
    keccak256_concat(&[SIGNED_MESSAGE_PREFIX, &hash[..]])
}

/// Parse a 0x-prefixed (or bare) hex string into a digest
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
    bytes.try_into().ok()
}

/// Serde helpers for fixed-size byte strings: 0x hex for JSON, raw bytes for bincode
pub mod hex_bytes {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FixedVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for FixedVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} bytes or a hex string", N)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let bytes = hex::decode(v.trim_start_matches("0x")).map_err(E::custom)?;
                let len = bytes.len();
                bytes
                    .try_into()
                    .map_err(|_| E::invalid_length(len, &self))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                v.try_into().map_err(|_| E::invalid_length(v.len(), &self))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(FixedVisitor::<N>)
        } else {
            deserializer.deserialize_bytes(FixedVisitor::<N>)
        }
    }
}
