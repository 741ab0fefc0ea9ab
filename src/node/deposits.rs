//! Deposit watcher
//!
//! Follows deposits recorded by the base-chain contract and reports the ones
//! that have not been brought into the plasma chain yet.

use crate::rootchain::{Deposit, RootChain};
use crate::storage::{Cursor, Storage};
use std::sync::Arc;

use super::NodeError;

/// Deposits seen in one polling round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepositReport {
    pub found: usize,
    /// Deposits with no deposit transaction on the plasma chain yet
    pub unclaimed: Vec<Deposit>,
}

/// Polls the base chain for new deposits
#[derive(Clone)]
pub struct DepositWatcher {
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
}

impl DepositWatcher {
    pub fn new(storage: Arc<dyn Storage>, root_chain: Arc<dyn RootChain>) -> Self {
        Self {
            storage,
            root_chain,
        }
    }

    /// Read deposits recorded since the last poll and advance the cursor
    pub fn poll(&self) -> Result<DepositReport, NodeError> {
        let head = self.root_chain.head_height()?;
        let from = self.storage.cursor(Cursor::DepositPoll)? + 1;
        let mut report = DepositReport::default();
        if from > head {
            return Ok(report);
        }

        let deposits = self.root_chain.deposits(from, head)?;
        report.found = deposits.len();
        for deposit in deposits {
            if self.storage.find_double_spending_deposit(&deposit.nonce)?.is_some() {
                continue;
            }
            log::debug!(
                "Deposit {} of {} for {} at base-chain block {}",
                deposit.nonce,
                deposit.amount,
                deposit.owner,
                deposit.eth_block_number
            );
            report.unclaimed.push(deposit);
        }

        self.storage.save_cursor(Cursor::DepositPoll, head)?;
        Ok(report)
    }
}
