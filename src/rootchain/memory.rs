//! In-process base chain

use super::{
    Challenge, Deposit, RootChain, RootChainError, StartedDepositExit, StartedExit,
};
use crate::core::{Address, BlockResult, OutputPosition};
use crate::crypto::keccak256;
use num_bigint::{BigInt, BigUint};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct State {
    height: u64,
    deposits: HashMap<BigUint, Deposit>,
    submitted: Vec<BlockResult>,
    exits: Vec<StartedExit>,
    deposit_exits: Vec<StartedDepositExit>,
    challenges: Vec<Challenge>,
    /// Number of upcoming `submit_block` calls that fail
    failing_submissions: usize,
    failing_challenges: usize,
}

/// Base chain kept in memory; every recorded event mines one block
#[derive(Debug, Default)]
pub struct MemoryRootChain {
    state: Mutex<State>,
}

impl MemoryRootChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deposit, as the deposit contract would
    pub fn add_deposit(
        &self,
        nonce: impl Into<BigUint>,
        owner: Address,
        amount: impl Into<BigInt>,
    ) -> Deposit {
        let mut state = self.state.lock();
        state.height += 1;
        let deposit = Deposit {
            nonce: nonce.into(),
            owner,
            amount: amount.into(),
            eth_block_number: state.height,
        };
        state.deposits.insert(deposit.nonce.clone(), deposit.clone());
        deposit
    }

    /// Start an exit of a plasma output
    pub fn start_exit(
        &self,
        position: OutputPosition,
        owner: Address,
        amount: impl Into<BigInt>,
    ) -> StartedExit {
        let mut state = self.state.lock();
        state.height += 1;
        let exit = StartedExit {
            position,
            owner,
            amount: amount.into(),
            eth_block_number: state.height,
            eth_tx_hash: keccak256(format!("exit:{}:{}", position, state.height).as_bytes()),
        };
        state.exits.push(exit.clone());
        exit
    }

    /// Start an exit of a deposit
    pub fn start_deposit_exit(&self, nonce: impl Into<BigUint>) -> Option<StartedDepositExit> {
        let mut state = self.state.lock();
        let nonce = nonce.into();
        let deposit = state.deposits.get(&nonce)?.clone();
        state.height += 1;
        let exit = StartedDepositExit {
            eth_tx_hash: keccak256(format!("deposit-exit:{}:{}", nonce, state.height).as_bytes()),
            nonce,
            owner: deposit.owner,
            amount: deposit.amount,
            eth_block_number: state.height,
        };
        state.deposit_exits.push(exit.clone());
        Some(exit)
    }

    /// Make the next `count` block submissions fail
    pub fn fail_next_submissions(&self, count: usize) {
        self.state.lock().failing_submissions = count;
    }

    /// Make the next `count` challenges fail
    pub fn fail_next_challenges(&self, count: usize) {
        self.state.lock().failing_challenges = count;
    }

    pub fn submitted_blocks(&self) -> Vec<BlockResult> {
        self.state.lock().submitted.clone()
    }

    pub fn challenges(&self) -> Vec<Challenge> {
        self.state.lock().challenges.clone()
    }
}

impl RootChain for MemoryRootChain {
    fn lookup_deposit(&self, nonce: &BigUint) -> Result<Option<Deposit>, RootChainError> {
        Ok(self.state.lock().deposits.get(nonce).cloned())
    }

    fn deposits(&self, from: u64, to: u64) -> Result<Vec<Deposit>, RootChainError> {
        let mut found: Vec<Deposit> = self
            .state
            .lock()
            .deposits
            .values()
            .filter(|d| (from..=to).contains(&d.eth_block_number))
            .cloned()
            .collect();
        found.sort_by_key(|d| d.eth_block_number);
        Ok(found)
    }

    fn submit_block(&self, block: &BlockResult) -> Result<(), RootChainError> {
        let mut state = self.state.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(RootChainError::Unavailable("simulated outage".to_string()));
        }

        let expected = state.submitted.last().map_or(1, |b| b.block_number + 1);
        if block.block_number != expected {
            return Err(RootChainError::Rejected(format!(
                "expected block {}, got {}",
                expected, block.block_number
            )));
        }

        state.height += 1;
        state.submitted.push(block.clone());
        Ok(())
    }

    fn head_height(&self) -> Result<u64, RootChainError> {
        Ok(self.state.lock().height)
    }

    fn started_exits(&self, from: u64, to: u64) -> Result<Vec<StartedExit>, RootChainError> {
        Ok(self
            .state
            .lock()
            .exits
            .iter()
            .filter(|e| (from..=to).contains(&e.eth_block_number))
            .cloned()
            .collect())
    }

    fn started_deposit_exits(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<StartedDepositExit>, RootChainError> {
        Ok(self
            .state
            .lock()
            .deposit_exits
            .iter()
            .filter(|e| (from..=to).contains(&e.eth_block_number))
            .cloned()
            .collect())
    }

    fn challenge_exit(&self, challenge: &Challenge) -> Result<(), RootChainError> {
        let mut state = self.state.lock();
        if state.failing_challenges > 0 {
            state.failing_challenges -= 1;
            return Err(RootChainError::Unavailable("simulated outage".to_string()));
        }
        state.height += 1;
        state.challenges.push(challenge.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ZERO_HASH;

    fn block_result(number: u64) -> BlockResult {
        BlockResult {
            merkle_root: ZERO_HASH,
            number_of_transactions: 1,
            block_fees: BigInt::from(0),
            block_number: number,
        }
    }

    #[test]
    fn test_deposit_lookup() {
        let chain = MemoryRootChain::new();
        let owner = Address([9u8; 20]);
        chain.add_deposit(1u32, owner, 100);

        let found = chain.lookup_deposit(&BigUint::from(1u32)).unwrap().unwrap();
        assert_eq!(found.owner, owner);
        assert_eq!(found.amount, BigInt::from(100));
        assert!(chain.lookup_deposit(&BigUint::from(2u32)).unwrap().is_none());
    }

    #[test]
    fn test_submission_order_and_outage() {
        let chain = MemoryRootChain::new();
        assert!(chain.submit_block(&block_result(2)).is_err());

        chain.fail_next_submissions(1);
        assert!(matches!(
            chain.submit_block(&block_result(1)),
            Err(RootChainError::Unavailable(_))
        ));
        chain.submit_block(&block_result(1)).unwrap();
        chain.submit_block(&block_result(2)).unwrap();
        assert_eq!(chain.submitted_blocks().len(), 2);
    }

    #[test]
    fn test_exit_range_filter() {
        let chain = MemoryRootChain::new();
        let owner = Address([1u8; 20]);
        let first = chain.start_exit(OutputPosition::new(1, 0, 0), owner, 10);
        let second = chain.start_exit(OutputPosition::new(2, 0, 0), owner, 10);

        let only_first = chain
            .started_exits(first.eth_block_number, first.eth_block_number)
            .unwrap();
        assert_eq!(only_first, vec![first]);
        assert_eq!(chain.started_exits(0, second.eth_block_number).unwrap().len(), 2);
        assert!(chain.start_deposit_exit(5u32).is_none());
    }

    #[test]
    fn test_deposit_range_filter() {
        let chain = MemoryRootChain::new();
        let owner = Address([3u8; 20]);
        let first = chain.add_deposit(4u32, owner, 1);
        chain.start_exit(OutputPosition::new(1, 0, 0), owner, 1);
        let second = chain.add_deposit(2u32, owner, 2);

        let all = chain.deposits(1, chain.head_height().unwrap()).unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        assert_eq!(
            chain.deposits(second.eth_block_number, second.eth_block_number).unwrap(),
            vec![second]
        );
        assert!(chain.deposits(first.eth_block_number + 1, first.eth_block_number + 1).unwrap().is_empty());
    }
}
