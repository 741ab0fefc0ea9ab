//! Canonical word encoding used for signature and transaction hashes
//!
//! Every field is written as a 32 byte big-endian word, the layout Solidity's
//! `abi.encode` produces for static types, so the base-chain contract can
//! rebuild the exact preimage. Integers wider than 256 bits keep their low
//! 256 bits.

use crate::crypto::Address;
use num_bigint::{BigInt, BigUint, Sign};

/// Size of one encoded word
pub const WORD_SIZE: usize = 32;

/// Appends fixed-width words to a buffer
#[derive(Debug, Default)]
pub struct WordEncoder {
    buf: Vec<u8>,
}

impl WordEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_words(words: usize) -> Self {
        Self {
            buf: Vec::with_capacity(words * WORD_SIZE),
        }
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.word_from_be(&value.to_be_bytes(), 0x00)
    }

    pub fn address(&mut self, address: &Address) -> &mut Self {
        self.word_from_be(address.as_bytes(), 0x00)
    }

    pub fn uint(&mut self, value: &BigUint) -> &mut Self {
        self.word_from_be(&value.to_bytes_be(), 0x00)
    }

    /// Two's complement, sign-extended to a full word
    pub fn int(&mut self, value: &BigInt) -> &mut Self {
        let pad = if value.sign() == Sign::Minus { 0xff } else { 0x00 };
        self.word_from_be(&value.to_signed_bytes_be(), pad)
    }

    /// Raw bytes appended without padding
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn word_from_be(&mut self, bytes: &[u8], pad: u8) -> &mut Self {
        let bytes = if bytes.len() > WORD_SIZE {
            &bytes[bytes.len() - WORD_SIZE..]
        } else {
            bytes
        };
        self.buf
            .extend(std::iter::repeat(pad).take(WORD_SIZE - bytes.len()));
        self.buf.extend_from_slice(bytes);
        self
    }
}
