//! Transaction confirmer
//!
//! Input owners confirm a packaged transaction by signing its confirm hash,
//! which binds the transaction to the merkle root of its block.

use crate::core::{ConfirmedTransaction, Signature};
use crate::rootchain::RootChain;
use crate::storage::{Storage, StorageError};
use crate::validation::{validate_confirm_sigs, ValidationError, ValidationResult};
use std::sync::Arc;

/// Validates and records confirmation signatures
#[derive(Clone)]
pub struct TransactionConfirmer {
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
}

impl TransactionConfirmer {
    pub fn new(storage: Arc<dyn Storage>, root_chain: Arc<dyn RootChain>) -> Self {
        Self {
            storage,
            root_chain,
        }
    }

    /// Confirm the transaction at `block_number:transaction_index`
    pub fn confirm(
        &self,
        block_number: u64,
        transaction_index: u32,
        sigs: [Signature; 2],
    ) -> ValidationResult<ConfirmedTransaction> {
        let not_found = || ValidationError::UnknownTransaction {
            block: block_number,
            index: transaction_index,
        };
        let block = self
            .storage
            .block_at_height(block_number)?
            .ok_or_else(not_found)?;
        let packaged = self
            .storage
            .find_transaction(block_number, transaction_index)?
            .ok_or_else(not_found)?;
        if packaged.is_confirmed() {
            return Err(ValidationError::AlreadyConfirmed {
                block: block_number,
                index: transaction_index,
            });
        }

        validate_confirm_sigs(
            self.storage.as_ref(),
            self.root_chain.as_ref(),
            &packaged.transaction,
            block.merkle_root(),
            &sigs,
        )?;

        let confirmed = self
            .storage
            .confirm_transaction(block_number, transaction_index, sigs)
            .map_err(rejection_from_storage)?;
        log::info!(
            "Confirmed transaction {}:{}",
            block_number,
            transaction_index
        );
        Ok(confirmed)
    }
}

/// Storage outcomes caused by the request rather than the store
fn rejection_from_storage(err: StorageError) -> ValidationError {
    match err {
        StorageError::AlreadyConfirmed { block, index } => {
            ValidationError::AlreadyConfirmed { block, index }
        }
        StorageError::TransactionNotFound { block, index } => {
            ValidationError::UnknownTransaction { block, index }
        }
        StorageError::EmptyConfirmation => ValidationError::EmptyConfirmation,
        other => ValidationError::Storage(other),
    }
}
