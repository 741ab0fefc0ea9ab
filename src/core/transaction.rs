//! Transaction data model for the plasma chain
//!
//! A transaction spends up to two inputs and creates up to two outputs:
//! - an input is either zero (unused), a deposit made on the base chain, or a
//!   reference to an output of an earlier plasma transaction
//! - the sender signs the body once per spent input
//! - after inclusion, the owners of the spent outputs attach confirmation
//!   signatures over the block's merkle root

use crate::core::encoding::WordEncoder;
use crate::crypto::{keccak256, keccak256_concat, Address, Hash, KeyPair, Signature};
use num_bigint::{BigInt, BigUint, Sign};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Words written per input by the canonical encoding
const INPUT_WORDS: usize = 4;

/// Words written per output by the canonical encoding
const OUTPUT_WORDS: usize = 2;

/// Words in a signed transaction body
const BODY_WORDS: usize = 2 * INPUT_WORDS + 2 * OUTPUT_WORDS + 1;

// =============================================================================
// Output Position
// =============================================================================

/// Location of an output inside the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPosition {
    pub block_number: u64,
    pub transaction_index: u32,
    pub output_index: u8,
}

impl OutputPosition {
    pub fn new(block_number: u64, transaction_index: u32, output_index: u8) -> Self {
        Self {
            block_number,
            transaction_index,
            output_index,
        }
    }
}

impl fmt::Display for OutputPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.transaction_index, self.output_index
        )
    }
}

// =============================================================================
// Input
// =============================================================================

/// Reference to the value a transaction spends
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub block_number: u64,
    pub transaction_index: u32,
    pub output_index: u8,
    pub deposit_nonce: BigUint,
}

impl Input {
    /// The unused input
    pub fn zero() -> Self {
        Self::default()
    }

    /// Input spending an output of an earlier plasma transaction
    pub fn spend(block_number: u64, transaction_index: u32, output_index: u8) -> Self {
        Self {
            block_number,
            transaction_index,
            output_index,
            deposit_nonce: BigUint::default(),
        }
    }

    /// Input consuming a base-chain deposit
    pub fn deposit(nonce: impl Into<BigUint>) -> Self {
        Self {
            deposit_nonce: nonce.into(),
            ..Self::default()
        }
    }

    fn has_no_position(&self) -> bool {
        self.block_number == 0 && self.transaction_index == 0 && self.output_index == 0
    }

    pub fn is_zero(&self) -> bool {
        self.has_no_position() && self.deposit_nonce.bits() == 0
    }

    pub fn is_deposit(&self) -> bool {
        self.has_no_position() && self.deposit_nonce.bits() != 0
    }

    pub fn is_spend(&self) -> bool {
        self.block_number >= 1
    }

    /// Position of the referenced output
    pub fn position(&self) -> OutputPosition {
        OutputPosition::new(self.block_number, self.transaction_index, self.output_index)
    }

    fn encode(&self, enc: &mut WordEncoder) {
        enc.u64(self.block_number)
            .u64(u64::from(self.transaction_index))
            .u64(u64::from(self.output_index))
            .uint(&self.deposit_nonce);
    }
}

// =============================================================================
// Output
// =============================================================================

/// Value assigned to an owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
    pub owner: Address,
    pub amount: BigInt,
}

impl Output {
    pub fn new(owner: Address, amount: impl Into<BigInt>) -> Self {
        Self {
            owner,
            amount: amount.into(),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.owner.is_zero() && self.amount.sign() == Sign::NoSign
    }

    pub fn is_negative(&self) -> bool {
        self.amount.sign() == Sign::Minus
    }

    fn encode(&self, enc: &mut WordEncoder) {
        enc.address(&self.owner).int(&self.amount);
    }
}

// =============================================================================
// Transaction Body
// =============================================================================

/// The signed content of a transaction plus its assigned position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBody {
    pub input0: Input,
    pub input0_confirm_sig: Signature,
    pub input1: Input,
    pub input1_confirm_sig: Signature,
    pub output0: Output,
    pub output1: Output,
    pub fee: BigInt,
    /// Assigned at packaging time
    pub block_number: u64,
    /// Assigned at packaging time
    pub transaction_index: u32,
}

impl TransactionBody {
    pub fn input(&self, index: usize) -> &Input {
        if index == 0 {
            &self.input0
        } else {
            &self.input1
        }
    }

    pub fn input_confirm_sig(&self, index: usize) -> &Signature {
        if index == 0 {
            &self.input0_confirm_sig
        } else {
            &self.input1_confirm_sig
        }
    }

    pub fn output(&self, index: usize) -> &Output {
        if index == 0 {
            &self.output0
        } else {
            &self.output1
        }
    }

    pub fn outputs(&self) -> [&Output; 2] {
        [&self.output0, &self.output1]
    }

    pub fn is_deposit(&self) -> bool {
        self.input0.is_deposit()
    }

    /// Sum of both outputs plus the fee
    pub fn total_output(&self) -> BigInt {
        &self.output0.amount + &self.output1.amount + &self.fee
    }

    /// Canonical encoding of the signed fields
    ///
    /// Excludes the assigned position and both confirm signatures, so the
    /// encoding does not change when the transaction is packaged or confirmed.
    pub fn encode_signed_fields(&self) -> Vec<u8> {
        let mut enc = WordEncoder::with_words(BODY_WORDS);
        self.input0.encode(&mut enc);
        self.input1.encode(&mut enc);
        self.output0.encode(&mut enc);
        self.output1.encode(&mut enc);
        enc.int(&self.fee);
        enc.finish()
    }

    /// Hash every input owner signs
    pub fn signature_hash(&self) -> Hash {
        keccak256(&self.encode_signed_fields())
    }

    /// Hash an input owner signs to confirm inclusion under `merkle_root`
    pub fn confirm_hash(&self, merkle_root: &Hash) -> Hash {
        confirm_hash(&self.signature_hash(), merkle_root)
    }
}

/// Digest covered by a confirmation signature
pub fn confirm_hash(signature_hash: &Hash, merkle_root: &Hash) -> Hash {
    keccak256_concat(&[&signature_hash[..], &merkle_root[..]])
}

// =============================================================================
// Transaction
// =============================================================================

/// A body with one signature per spent input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub body: TransactionBody,
    pub sigs: [Signature; 2],
}

impl Transaction {
    pub fn new(body: TransactionBody) -> Self {
        Self {
            body,
            sigs: [Signature::EMPTY; 2],
        }
    }

    /// Sign the body on behalf of input `index`
    pub fn sign_input(&mut self, index: usize, key: &KeyPair) {
        self.sigs[index.min(1)] = key.sign(&self.body.signature_hash());
    }

    /// Stable transaction hash: the signed fields plus both signatures
    ///
    /// Used as the merkle leaf and as the lookup key of the transaction.
    pub fn hash(&self) -> Hash {
        let encoded = self.body.encode_signed_fields();
        keccak256_concat(&[&encoded[..], self.sigs[0].as_bytes(), self.sigs[1].as_bytes()])
    }

    pub fn is_deposit(&self) -> bool {
        self.body.is_deposit()
    }
}

// =============================================================================
// Confirmed Transaction
// =============================================================================

/// A packaged transaction and the confirmation signatures of its input owners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedTransaction {
    pub transaction: Transaction,
    pub confirm_sigs: [Signature; 2],
}

impl ConfirmedTransaction {
    /// Wrap a packaged transaction that has no confirmations yet
    pub fn unconfirmed(transaction: Transaction) -> Self {
        Self {
            transaction,
            confirm_sigs: [Signature::EMPTY; 2],
        }
    }

    pub fn body(&self) -> &TransactionBody {
        &self.transaction.body
    }

    pub fn hash(&self) -> Hash {
        self.transaction.hash()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirm_sigs.iter().any(|sig| !sig.is_empty())
    }

    /// Position of output `output_index` of this transaction
    pub fn output_position(&self, output_index: u8) -> OutputPosition {
        OutputPosition::new(
            self.transaction.body.block_number,
            self.transaction.body.transaction_index,
            output_index,
        )
    }
}
