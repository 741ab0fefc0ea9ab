//! Exit watcher
//!
//! Follows exits started on the base chain. An exit of a value that was
//! already spent on the plasma chain is challenged with the spending
//! transaction and its merkle inclusion proof; any other exit is recorded so
//! the exited value can no longer be spent.

use crate::core::{ConfirmedTransaction, Hash};
use crate::crypto::merkle_root_and_proof;
use crate::rootchain::{
    Challenge, ExitTarget, RootChain, RootChainError, StartedDepositExit, StartedExit,
};
use crate::storage::{Cursor, Storage, StorageError};
use std::sync::Arc;

use super::NodeError;

/// Result of one polling round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub exited: usize,
    pub challenged: usize,
    pub skipped: usize,
}

enum Outcome {
    Exited,
    Challenged,
    Skipped,
}

impl ExitReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Exited => self.exited += 1,
            Outcome::Challenged => self.challenged += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Processes started exits between polls of the base chain
#[derive(Clone)]
pub struct ExitWatcher {
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
}

impl ExitWatcher {
    pub fn new(storage: Arc<dyn Storage>, root_chain: Arc<dyn RootChain>) -> Self {
        Self {
            storage,
            root_chain,
        }
    }

    /// Process every exit started since the last poll
    pub fn poll(&self) -> Result<ExitReport, NodeError> {
        let head = self.root_chain.head_height()?;
        let mut report = ExitReport::default();

        self.follow(
            Cursor::TransactionExitPoll,
            head,
            |from, to| self.root_chain.started_exits(from, to),
            |exit: &StartedExit| exit.eth_block_number,
            |exit| self.process_exit(exit),
            &mut report,
        )?;
        self.follow(
            Cursor::DepositExitPoll,
            head,
            |from, to| self.root_chain.started_deposit_exits(from, to),
            |exit: &StartedDepositExit| exit.eth_block_number,
            |exit| self.process_deposit_exit(exit),
            &mut report,
        )?;

        Ok(report)
    }

    /// Process the events after `cursor` up to `head` in base-chain block order
    ///
    /// `cursor` is saved each time a base-chain block is fully processed, so a
    /// failure only repeats the exits of the block it happened in.
    fn follow<E>(
        &self,
        cursor: Cursor,
        head: u64,
        fetch: impl FnOnce(u64, u64) -> Result<Vec<E>, RootChainError>,
        block_of: impl Fn(&E) -> u64,
        mut process: impl FnMut(&E) -> Result<Outcome, NodeError>,
        report: &mut ExitReport,
    ) -> Result<(), NodeError> {
        let from = self.storage.cursor(cursor)? + 1;
        if from > head {
            return Ok(());
        }

        let mut events = fetch(from, head)?;
        events.sort_by_key(|event| block_of(event));
        let mut done = from - 1;
        for event in &events {
            let finished = block_of(event).saturating_sub(1);
            if finished > done {
                self.storage.save_cursor(cursor, finished)?;
                done = finished;
            }
            report.record(process(event)?);
        }
        self.storage.save_cursor(cursor, head)?;
        Ok(())
    }

    fn process_exit(&self, exit: &StartedExit) -> Result<Outcome, NodeError> {
        let target = ExitTarget::Output(exit.position);
        if let Some(spender) = self.storage.find_double_spending_transaction(&exit.position)? {
            self.challenge(target, spender)?;
            log::warn!("Challenged exit of spent output {}", exit.position);
            return Ok(Outcome::Challenged);
        }

        match self
            .storage
            .mark_as_exited(&exit.position, exit.eth_block_number, &exit.eth_tx_hash)
        {
            Ok(()) => Ok(Outcome::Exited),
            // nothing on this chain to challenge it with
            Err(StorageError::MissingInput(position)) => {
                log::warn!("Ignoring exit of unknown output {}", position);
                Ok(Outcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_deposit_exit(&self, exit: &StartedDepositExit) -> Result<Outcome, NodeError> {
        if let Some(spender) = self.storage.find_double_spending_deposit(&exit.nonce)? {
            self.challenge(ExitTarget::Deposit(exit.nonce.clone()), spender)?;
            log::warn!("Challenged exit of consumed deposit {}", exit.nonce);
            return Ok(Outcome::Challenged);
        }

        self.storage
            .mark_deposit_as_exited(&exit.nonce, exit.eth_block_number, &exit.eth_tx_hash)?;
        Ok(Outcome::Exited)
    }

    fn challenge(&self, target: ExitTarget, spender: ConfirmedTransaction) -> Result<(), NodeError> {
        let block_number = spender.body().block_number;
        let index = spender.body().transaction_index as usize;
        let leaves: Vec<Hash> = self
            .storage
            .find_transactions_by_block(block_number)?
            .iter()
            .map(ConfirmedTransaction::hash)
            .collect();
        let (merkle_root, proof) = merkle_root_and_proof(&leaves, index).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "transaction {}:{} missing from its block",
                block_number, index
            ))
        })?;

        let challenge = Challenge {
            target,
            challenging_tx: spender,
            merkle_root,
            proof: proof.to_bytes(),
        };
        self.root_chain.challenge_exit(&challenge)?;
        Ok(())
    }
}
