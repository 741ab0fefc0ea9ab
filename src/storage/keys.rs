//! Key layout of the chain database
//!
//! Every namespace starts with an ASCII prefix ending in `::`. Numbers are
//! written big-endian at fixed width so that prefix scans return entries in
//! numeric order.

use crate::core::{Address, Hash, OutputPosition, WordEncoder};
use num_bigint::BigUint;

pub const TX_BY_HASH: &[u8] = b"tx::hash::";
pub const TX_BY_POSITION: &[u8] = b"tx::pos::";
pub const UTXO: &[u8] = b"utxo::";
pub const SPEND: &[u8] = b"spend::";
pub const DEPOSIT: &[u8] = b"deposit::";
pub const EXIT: &[u8] = b"exit::";
pub const DEPOSIT_EXIT: &[u8] = b"depexit::";
pub const BLOCK_BY_HASH: &[u8] = b"blk::hash::";
pub const BLOCK_BY_NUMBER: &[u8] = b"blk::num::";
pub const BLOCK_META: &[u8] = b"blkmeta::";
pub const LATEST_BLOCK: &[u8] = b"blk::LATEST_BLOCK";
pub const CURSOR: &[u8] = b"cursor::";

fn key(prefix: &[u8], capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + capacity);
    key.extend_from_slice(prefix);
    key
}

fn position_key(prefix: &[u8], position: &OutputPosition) -> Vec<u8> {
    let mut key = key(prefix, 13);
    key.extend_from_slice(&position.block_number.to_be_bytes());
    key.extend_from_slice(&position.transaction_index.to_be_bytes());
    key.push(position.output_index);
    key
}

fn nonce_key(prefix: &[u8], nonce: &BigUint) -> Vec<u8> {
    let mut enc = WordEncoder::with_words(1);
    enc.raw(prefix).uint(nonce);
    enc.finish()
}

pub fn tx_by_hash(hash: &Hash) -> Vec<u8> {
    let mut key = key(TX_BY_HASH, 32);
    key.extend_from_slice(hash);
    key
}

pub fn tx_by_position(block_number: u64, transaction_index: u32) -> Vec<u8> {
    let mut key = block_transactions(block_number);
    key.extend_from_slice(&transaction_index.to_be_bytes());
    key
}

/// Prefix shared by every transaction of a block
pub fn block_transactions(block_number: u64) -> Vec<u8> {
    let mut key = key(TX_BY_POSITION, 12);
    key.extend_from_slice(&block_number.to_be_bytes());
    key
}

pub fn utxo(owner: &Address, tx_hash: &Hash, output_index: u8) -> Vec<u8> {
    let mut key = utxos_of(owner);
    key.extend_from_slice(tx_hash);
    key.push(output_index);
    key
}

/// Prefix shared by every unspent output of `owner`
pub fn utxos_of(owner: &Address) -> Vec<u8> {
    let mut key = key(UTXO, 20 + 32 + 1);
    key.extend_from_slice(owner.as_bytes());
    key
}

pub fn spend(position: &OutputPosition) -> Vec<u8> {
    position_key(SPEND, position)
}

pub fn exit(position: &OutputPosition) -> Vec<u8> {
    position_key(EXIT, position)
}

pub fn deposit(nonce: &BigUint) -> Vec<u8> {
    nonce_key(DEPOSIT, nonce)
}

pub fn deposit_exit(nonce: &BigUint) -> Vec<u8> {
    nonce_key(DEPOSIT_EXIT, nonce)
}

pub fn block_by_hash(hash: &Hash) -> Vec<u8> {
    let mut key = key(BLOCK_BY_HASH, 32);
    key.extend_from_slice(hash);
    key
}

pub fn block_by_number(number: u64) -> Vec<u8> {
    let mut key = key(BLOCK_BY_NUMBER, 8);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

pub fn block_meta(number: u64) -> Vec<u8> {
    let mut key = key(BLOCK_META, 8);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

pub fn cursor(name: &str) -> Vec<u8> {
    let mut key = key(CURSOR, name.len());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Decode a big-endian u64 value
pub fn read_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}
