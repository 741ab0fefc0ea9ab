//! Transaction and block validation
//!
//! Validation reads prior chain state but never writes it. Every check
//! returns the first rule a candidate breaks:
//! - spends must reference confirmed-by-echo outputs their sender owns
//! - deposits must match a base-chain deposit exactly
//! - value is conserved and nothing is spent twice
//!
//! Rejections are terminal for the submitter; storage and base-chain errors
//! are infrastructure failures and are reported separately.

use crate::core::{
    confirm_hash, Address, Block, ConfirmedTransaction, Input, Signature, Transaction,
};
use crate::crypto::{calculate_merkle_root, verify_signature, Hash};
use crate::rootchain::{RootChain, RootChainError};
use crate::storage::{Storage, StorageError};
use num_bigint::{BigInt, BigUint, Sign};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Output {0} has a negative amount")]
    NegativeOutput(usize),
    #[error("Fee is negative")]
    NegativeFee,
    #[error("Input {input} references unknown transaction {block}:{index}")]
    TxNotFound { input: usize, block: u64, index: u32 },
    #[error("Input {0} is neither a plasma output nor a deposit")]
    MalformedInput(usize),
    #[error("Input {0} confirm signature does not match the recorded one")]
    ConfirmSigMismatch(usize),
    #[error("Signature {0} is not valid for the input owner")]
    InvalidSignature(usize),
    #[error("Both inputs reference the same output")]
    IdenticalInputs,
    #[error("Inputs total {inputs} but outputs and fee total {outputs}")]
    InputOutputValueMismatch { inputs: BigInt, outputs: BigInt },
    #[error("Input already spent")]
    DoubleSpent,
    #[error("Deposit transactions cannot define input 1")]
    DepositDefinedInput1,
    #[error("Deposit transactions cannot carry confirm signatures")]
    DepositNonEmptyConfirmSig,
    #[error("Deposit {0} not found on the base chain")]
    DepositNotFound(BigUint),
    #[error("Transaction has no input")]
    NoInputs,
    #[error("Confirm signature {0} is not valid")]
    InvalidConfirmSig(usize),
    #[error("Transaction {block}:{index} does not exist")]
    UnknownTransaction { block: u64, index: u32 },
    #[error("Transaction {block}:{index} is already confirmed")]
    AlreadyConfirmed { block: u64, index: u32 },
    #[error("Confirmation carries no signature")]
    EmptyConfirmation,
    #[error("Block {0} has an invalid hash")]
    InvalidBlockHash(u64),
    #[error("Block {0} merkle root does not match its transactions")]
    MerkleRootMismatch(u64),
    #[error("Transaction {index} of block {block} carries the wrong position")]
    PositionMismatch { block: u64, index: usize },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Base chain error: {0}")]
    RootChain(#[from] RootChainError),
}

impl ValidationError {
    /// True for errors caused by the candidate itself rather than infrastructure
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            ValidationError::Storage(_) | ValidationError::RootChain(_)
        )
    }
}

pub type ValidationResult<T = ()> = Result<T, ValidationError>;

// =============================================================================
// Transactions
// =============================================================================

/// Validate any transaction, dispatching on its first input
pub fn validate_transaction(
    storage: &dyn Storage,
    root_chain: &dyn RootChain,
    tx: &Transaction,
) -> ValidationResult {
    if tx.is_deposit() {
        validate_deposit(storage, root_chain, tx)
    } else {
        validate_spend(storage, tx)
    }
}

fn check_amounts(tx: &Transaction) -> ValidationResult {
    for (index, output) in tx.body.outputs().into_iter().enumerate() {
        if output.is_negative() {
            return Err(ValidationError::NegativeOutput(index));
        }
    }
    if tx.body.fee.sign() == Sign::Minus {
        return Err(ValidationError::NegativeFee);
    }
    Ok(())
}

/// Resolve input `index`, check its confirm echo and signature, return its amount
fn check_spent_input(
    storage: &dyn Storage,
    tx: &Transaction,
    index: usize,
) -> ValidationResult<BigInt> {
    let input = tx.body.input(index);
    let not_found = ValidationError::TxNotFound {
        input: index,
        block: input.block_number,
        index: input.transaction_index,
    };
    let output_index = input.output_index as usize;
    if output_index > 1 {
        return Err(not_found);
    }
    let prev = storage
        .find_transaction(input.block_number, input.transaction_index)?
        .ok_or(not_found)?;

    if prev.confirm_sigs[output_index] != *tx.body.input_confirm_sig(index) {
        return Err(ValidationError::ConfirmSigMismatch(index));
    }

    let spent = prev.body().output(output_index);
    if !verify_signature(&tx.body.signature_hash(), &tx.sigs[index], &spent.owner) {
        return Err(ValidationError::InvalidSignature(index));
    }

    Ok(spent.amount.clone())
}

/// Validate a transaction that spends earlier plasma outputs
pub fn validate_spend(storage: &dyn Storage, tx: &Transaction) -> ValidationResult {
    check_amounts(tx)?;

    let body = &tx.body;
    if body.input0.is_zero() {
        return Err(ValidationError::NoInputs);
    }
    for index in 0..2 {
        let input = body.input(index);
        if !input.is_zero() && !(input.is_spend() && input.deposit_nonce.bits() == 0) {
            return Err(ValidationError::MalformedInput(index));
        }
    }
    let mut total_in = check_spent_input(storage, tx, 0)?;

    if !body.input1.is_zero() {
        if body.input1.position() == body.input0.position() {
            return Err(ValidationError::IdenticalInputs);
        }
        total_in += check_spent_input(storage, tx, 1)?;
    }

    let total_out = body.total_output();
    if total_in != total_out {
        return Err(ValidationError::InputOutputValueMismatch {
            inputs: total_in,
            outputs: total_out,
        });
    }

    if storage.is_double_spent(tx)? {
        return Err(ValidationError::DoubleSpent);
    }
    Ok(())
}

/// Validate a transaction that brings a base-chain deposit into the chain
pub fn validate_deposit(
    storage: &dyn Storage,
    root_chain: &dyn RootChain,
    tx: &Transaction,
) -> ValidationResult {
    check_amounts(tx)?;

    let body = &tx.body;
    if !body.input1.is_zero() {
        return Err(ValidationError::DepositDefinedInput1);
    }
    if !body.input0_confirm_sig.is_empty() || !body.input1_confirm_sig.is_empty() {
        return Err(ValidationError::DepositNonEmptyConfirmSig);
    }

    let nonce = &body.input0.deposit_nonce;
    let deposit = root_chain
        .lookup_deposit(nonce)?
        .ok_or_else(|| ValidationError::DepositNotFound(nonce.clone()))?;

    let total_out = body.total_output();
    if deposit.amount != total_out {
        return Err(ValidationError::InputOutputValueMismatch {
            inputs: deposit.amount,
            outputs: total_out,
        });
    }

    let signature_hash = body.signature_hash();
    for (index, sig) in tx.sigs.iter().enumerate() {
        if !verify_signature(&signature_hash, sig, &deposit.owner) {
            return Err(ValidationError::InvalidSignature(index));
        }
    }

    if storage.is_double_spent(tx)? {
        return Err(ValidationError::DoubleSpent);
    }
    Ok(())
}

// =============================================================================
// Confirmations
// =============================================================================

/// Owner who must confirm input `index` of `tx`, `None` for a zero input
fn input_owner(
    storage: &dyn Storage,
    root_chain: &dyn RootChain,
    input: &Input,
    index: usize,
) -> ValidationResult<Option<Address>> {
    if input.is_zero() {
        return Ok(None);
    }
    if input.is_deposit() {
        let deposit = root_chain
            .lookup_deposit(&input.deposit_nonce)?
            .ok_or_else(|| ValidationError::DepositNotFound(input.deposit_nonce.clone()))?;
        return Ok(Some(deposit.owner));
    }
    let prev = storage
        .find_transaction(input.block_number, input.transaction_index)?
        .ok_or(ValidationError::TxNotFound {
            input: index,
            block: input.block_number,
            index: input.transaction_index,
        })?;
    Ok(Some(prev.body().output(input.output_index as usize).owner))
}

/// Check confirm signatures for a packaged transaction under `merkle_root`
///
/// Each non-zero input must be confirmed by its owner; a zero input must not
/// carry a confirmation.
pub fn validate_confirm_sigs(
    storage: &dyn Storage,
    root_chain: &dyn RootChain,
    tx: &Transaction,
    merkle_root: &Hash,
    sigs: &[Signature; 2],
) -> ValidationResult {
    let hash = confirm_hash(&tx.body.signature_hash(), merkle_root);
    for (index, sig) in sigs.iter().enumerate() {
        match input_owner(storage, root_chain, tx.body.input(index), index)? {
            Some(owner) => {
                if !verify_signature(&hash, sig, &owner) {
                    return Err(ValidationError::InvalidConfirmSig(index));
                }
            }
            None => {
                if !sig.is_empty() {
                    return Err(ValidationError::InvalidConfirmSig(index));
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Blocks
// =============================================================================

/// Validate a block produced elsewhere before adopting it
///
/// Transactions are checked in order against the current state, with
/// earlier transactions of the same block not yet visible. A block whose
/// transactions spend outputs created inside the same block is rejected.
pub fn validate_block(
    storage: &dyn Storage,
    root_chain: &dyn RootChain,
    block: &Block,
    txs: &[ConfirmedTransaction],
) -> ValidationResult {
    if !block.has_valid_hash() {
        return Err(ValidationError::InvalidBlockHash(block.number()));
    }

    let leaves: Vec<Hash> = txs.iter().map(ConfirmedTransaction::hash).collect();
    if calculate_merkle_root(&leaves) != *block.merkle_root() {
        return Err(ValidationError::MerkleRootMismatch(block.number()));
    }

    let mut claimed = std::collections::HashSet::new();
    for (index, confirmed) in txs.iter().enumerate() {
        let body = confirmed.body();
        if body.block_number != block.number() || body.transaction_index as usize != index {
            return Err(ValidationError::PositionMismatch {
                block: block.number(),
                index,
            });
        }

        validate_transaction(storage, root_chain, &confirmed.transaction)?;

        for input in [&body.input0, &body.input1] {
            if input.is_zero() {
                continue;
            }
            if !claimed.insert(input.clone()) {
                return Err(ValidationError::DoubleSpent);
            }
        }

        if confirmed.is_confirmed() {
            validate_confirm_sigs(
                storage,
                root_chain,
                &confirmed.transaction,
                block.merkle_root(),
                &confirmed.confirm_sigs,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockMetadata, Output, TransactionBody};
    use crate::crypto::KeyPair;
    use crate::rootchain::MemoryRootChain;
    use crate::storage::{SledStorage, StorageConfig};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        storage: SledStorage,
        root: MemoryRootChain,
        alice: KeyPair,
        bob: KeyPair,
    }

    /// Alice owns a confirmed 100 deposit at 1:0:0
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = SledStorage::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            flush_on_commit: false,
        })
        .unwrap();
        let root = MemoryRootChain::new();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        root.add_deposit(1u32, alice.address(), 100);
        let deposit = deposit_tx(1, &alice, 100);
        validate_deposit(&storage, &root, &deposit).unwrap();
        let result = storage.package_block(&[deposit.clone()]).unwrap();

        let confirm = alice.sign(&deposit.body.confirm_hash(&result.merkle_root));
        storage
            .confirm_transaction(1, 0, [confirm, Signature::EMPTY])
            .unwrap();

        Fixture {
            _dir: dir,
            storage,
            root,
            alice,
            bob,
        }
    }

    fn deposit_tx(nonce: u32, owner: &KeyPair, amount: i64) -> Transaction {
        let mut tx = Transaction::new(TransactionBody {
            input0: Input::deposit(nonce),
            output0: Output::new(owner.address(), amount),
            ..Default::default()
        });
        tx.sign_input(0, owner);
        tx.sign_input(1, owner);
        tx
    }

    /// Spend of 1:0:0 echoing its recorded confirm signature
    fn spend_from(f: &Fixture, to: Address, amount: i64, change: i64) -> Transaction {
        let prev = f.storage.find_transaction(1, 0).unwrap().unwrap();
        let mut tx = Transaction::new(TransactionBody {
            input0: Input::spend(1, 0, 0),
            input0_confirm_sig: prev.confirm_sigs[0],
            output0: Output::new(to, amount),
            output1: Output::new(f.alice.address(), change),
            ..Default::default()
        });
        tx.sign_input(0, &f.alice);
        tx
    }

    #[test]
    fn test_valid_spend() {
        let f = fixture();
        let tx = spend_from(&f, f.bob.address(), 40, 60);
        validate_spend(&f.storage, &tx).unwrap();
    }

    #[test]
    fn test_negative_output() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 140, -40);
        tx.sign_input(0, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::NegativeOutput(1))
        ));
    }

    #[test]
    fn test_unknown_input() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.body.input0 = Input::spend(5, 2, 0);
        tx.sign_input(0, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::TxNotFound {
                input: 0,
                block: 5,
                index: 2
            })
        ));
    }

    #[test]
    fn test_spend_input_with_deposit_nonce() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.body.input0.deposit_nonce = BigUint::from(9u32);
        tx.sign_input(0, &f.alice);
        let err = validate_spend(&f.storage, &tx).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedInput(0)));
        assert!(err.is_rejection());

        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.body.input1 = Input::deposit(1u32);
        tx.sign_input(0, &f.alice);
        tx.sign_input(1, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::MalformedInput(1))
        ));

        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.body.input0 = Input::spend(0, 3, 0);
        tx.sign_input(0, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::MalformedInput(0))
        ));
    }

    #[test]
    fn test_confirm_sig_mismatch() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.body.input0_confirm_sig = Signature::EMPTY;
        tx.sign_input(0, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::ConfirmSigMismatch(0))
        ));
    }

    #[test]
    fn test_signature_by_non_owner() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 40, 60);
        tx.sign_input(0, &f.bob);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::InvalidSignature(0))
        ));
    }

    #[test]
    fn test_identical_inputs() {
        let f = fixture();
        let mut tx = spend_from(&f, f.bob.address(), 100, 100);
        tx.body.input1 = tx.body.input0.clone();
        tx.body.input1_confirm_sig = tx.body.input0_confirm_sig;
        tx.sign_input(0, &f.alice);
        tx.sign_input(1, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::IdenticalInputs)
        ));
    }

    #[test]
    fn test_second_input_is_checked() {
        let f = fixture();
        f.root.add_deposit(2u32, f.alice.address(), 50);
        f.storage.package_block(&[deposit_tx(2, &f.alice, 50)]).unwrap();

        // input1 at 2:0:0 is unconfirmed, so an echoed signature cannot match
        let mut tx = spend_from(&f, f.bob.address(), 150, 0);
        tx.body.input1 = Input::spend(2, 0, 0);
        tx.body.input1_confirm_sig = tx.body.input0_confirm_sig;
        tx.sign_input(0, &f.alice);
        tx.sign_input(1, &f.alice);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::ConfirmSigMismatch(1))
        ));

        tx.body.input1_confirm_sig = Signature::EMPTY;
        tx.sign_input(0, &f.alice);
        tx.sign_input(1, &f.bob);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::InvalidSignature(1))
        ));

        tx.sign_input(1, &f.alice);
        validate_spend(&f.storage, &tx).unwrap();
    }

    #[test]
    fn test_value_mismatch() {
        let f = fixture();
        let tx = spend_from(&f, f.bob.address(), 40, 61);
        assert!(matches!(
            validate_spend(&f.storage, &tx),
            Err(ValidationError::InputOutputValueMismatch { .. })
        ));
    }

    #[test]
    fn test_double_spend_after_packaging() {
        let f = fixture();
        let first = spend_from(&f, f.bob.address(), 40, 60);
        f.storage.package_block(&[first]).unwrap();

        let second = spend_from(&f, f.bob.address(), 100, 0);
        let err = validate_spend(&f.storage, &second).unwrap_err();
        assert!(matches!(err, ValidationError::DoubleSpent));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_deposit_rules() {
        let f = fixture();
        f.root.add_deposit(7u32, f.alice.address(), 30);

        let mut with_input1 = deposit_tx(7, &f.alice, 30);
        with_input1.body.input1 = Input::spend(1, 0, 0);
        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &with_input1),
            Err(ValidationError::DepositDefinedInput1)
        ));

        let mut with_confirm = deposit_tx(7, &f.alice, 30);
        with_confirm.body.input0_confirm_sig = Signature([1u8; 65]);
        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &with_confirm),
            Err(ValidationError::DepositNonEmptyConfirmSig)
        ));

        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &deposit_tx(8, &f.alice, 30)),
            Err(ValidationError::DepositNotFound(_))
        ));
        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &deposit_tx(7, &f.alice, 31)),
            Err(ValidationError::InputOutputValueMismatch { .. })
        ));
        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &deposit_tx(7, &f.bob, 30)),
            Err(ValidationError::InvalidSignature(0))
        ));

        validate_deposit(&f.storage, &f.root, &deposit_tx(7, &f.alice, 30)).unwrap();
    }

    #[test]
    fn test_deposit_replay() {
        let f = fixture();
        assert!(matches!(
            validate_deposit(&f.storage, &f.root, &deposit_tx(1, &f.alice, 100)),
            Err(ValidationError::DoubleSpent)
        ));
    }

    #[test]
    fn test_confirm_sigs() {
        let f = fixture();
        let tx = spend_from(&f, f.bob.address(), 40, 60);
        let result = f.storage.package_block(&[tx.clone()]).unwrap();
        let hash = tx.body.confirm_hash(&result.merkle_root);

        let good = [f.alice.sign(&hash), Signature::EMPTY];
        validate_confirm_sigs(&f.storage, &f.root, &tx, &result.merkle_root, &good).unwrap();

        let wrong_signer = [f.bob.sign(&hash), Signature::EMPTY];
        assert!(matches!(
            validate_confirm_sigs(&f.storage, &f.root, &tx, &result.merkle_root, &wrong_signer),
            Err(ValidationError::InvalidConfirmSig(0))
        ));

        let extra = [f.alice.sign(&hash), f.alice.sign(&hash)];
        assert!(matches!(
            validate_confirm_sigs(&f.storage, &f.root, &tx, &result.merkle_root, &extra),
            Err(ValidationError::InvalidConfirmSig(1))
        ));
    }

    #[test]
    fn test_validate_block() {
        let f = fixture();
        let tx = spend_from(&f, f.bob.address(), 40, 60);
        let mut packaged = tx.clone();
        packaged.body.block_number = 2;
        let confirmed = vec![ConfirmedTransaction::unconfirmed(packaged)];

        let prev = f.storage.latest_block().unwrap().unwrap();
        let block = Block::new(tx.hash(), prev.block_hash, 2);
        validate_block(&f.storage, &f.root, &block, &confirmed).unwrap();
        f.storage
            .insert_block(&block, &BlockMetadata::new(1, BigInt::default()), &confirmed)
            .unwrap();
        assert_eq!(f.storage.balance(&f.bob.address()).unwrap(), BigInt::from(40));

        let bad_root = Block::new([0u8; 32], block.block_hash, 3);
        assert!(matches!(
            validate_block(&f.storage, &f.root, &bad_root, &[]),
            Err(ValidationError::MerkleRootMismatch(3))
        ));
    }
}
