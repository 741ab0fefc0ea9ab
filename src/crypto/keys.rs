//! ECDSA key management for the plasma chain
//!
//! Keys live on the secp256k1 curve and follow Ethereum conventions so that the
//! base-chain contract can check the same signatures:
//! - addresses are the last 20 bytes of keccak256 over the uncompressed public key
//! - signatures are 65 byte recoverable `r || s || v` values with `v` in {27, 28}
//! - the signed digest is the "Ethereum Signed Message" wrapping of a 32 byte hash

use rand::rngs::OsRng;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::hash::{eth_signed_message_hash, hex_bytes, keccak256, Hash};

/// Length of a recoverable signature in bytes
pub const SIGNATURE_LENGTH: usize = 65;

/// Length of an address in bytes
pub const ADDRESS_LENGTH: usize = 20;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

// =============================================================================
// Address
// =============================================================================

/// 20 byte account address
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex with a 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| KeyError::InvalidAddress(s.to_string()))?;
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidAddress(s.to_string()))?;
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        hex_bytes::deserialize(deserializer).map(Address)
    }
}

// =============================================================================
// Signature
// =============================================================================

/// Recoverable signature, `r || s || v`. All zeros means "no signature".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub const EMPTY: Signature = Signature([0u8; SIGNATURE_LENGTH]);

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Signature(empty)")
        } else {
            write!(f, "Signature(0x{})", hex::encode(self.0))
        }
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        hex_bytes::deserialize(deserializer).map(Signature)
    }
}

// =============================================================================
// Key Pair
// =============================================================================

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes =
            hex::decode(hex_key.trim_start_matches("0x")).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn address(&self) -> Address {
        public_key_to_address(&self.public_key)
    }

    /// Sign a 32 byte hash the way an Ethereum wallet signs a message
    pub fn sign(&self, hash: &Hash) -> Signature {
        sign_hash(&self.secret_key, hash)
    }
}

/// Convert a public key to its account address
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut address = [0u8; ADDRESS_LENGTH];
    address.copy_from_slice(&digest[12..]);
    Address(address)
}

/// Produce a recoverable signature over the prefixed form of `hash`
pub fn sign_hash(secret_key: &SecretKey, hash: &Hash) -> Signature {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(eth_signed_message_hash(hash));
    let (recovery_id, compact) = secp
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();

    let mut bytes = [0u8; SIGNATURE_LENGTH];
    bytes[..64].copy_from_slice(&compact);
    bytes[64] = recovery_id.to_i32() as u8 + 27;
    Signature(bytes)
}

/// Recover the address that signed `hash`
pub fn recover_address(hash: &Hash, signature: &Signature) -> Result<Address, KeyError> {
    let mut v = signature.0[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id =
        RecoveryId::from_i32(v as i32).map_err(|_| KeyError::InvalidRecoveryId(signature.0[64]))?;
    let recoverable = RecoverableSignature::from_compact(&signature.0[..64], recovery_id)?;

    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(eth_signed_message_hash(hash));
    let public_key = secp.recover_ecdsa(&message, &recoverable)?;
    Ok(public_key_to_address(&public_key))
}

/// True if `signature` over `hash` was produced by `signer`
pub fn verify_signature(hash: &Hash, signature: &Signature, signer: &Address) -> bool {
    if signature.is_empty() {
        return false;
    }
    match recover_address(hash, signature) {
        Ok(recovered) => recovered == *signer,
        Err(_) => false,
    }
}
