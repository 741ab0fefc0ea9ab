//! Chain database backed by sled
//!
//! Writes are collected into a `sled::Batch` per operation and applied in one
//! call, so a crash leaves either all of a block's index updates or none of
//! them. Operations that read several keys hold the read side of the commit
//! lock, which keeps them from observing a write group halfway through.

use super::{keys, Cursor, ExitLocator, Storage, StorageConfig, StorageError, Utxo};
use crate::core::{
    Address, Block, BlockMetadata, BlockResult, ConfirmedTransaction, FullBlock, Hash, Input,
    OutputPosition, Signature, Transaction, FIRST_BLOCK_NUMBER,
};
use crate::crypto::{calculate_merkle_root, ZERO_HASH};
use log::{debug, info};
use num_bigint::{BigInt, BigUint};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::{HashMap, HashSet};
use std::fs;

/// Name of the sled directory inside the data directory
const DB_DIR: &str = "chain";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_hash(bytes: &[u8]) -> Result<Hash, StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("expected 32 byte hash, got {}", bytes.len())))
}

fn decode_number(bytes: &[u8]) -> Result<u64, StorageError> {
    keys::read_u64(bytes)
        .ok_or_else(|| StorageError::Corrupt(format!("expected u64, got {} bytes", bytes.len())))
}

/// sled implementation of [`Storage`]
pub struct SledStorage {
    db: sled::Db,
    config: StorageConfig,
    commit_lock: RwLock<()>,
}

impl SledStorage {
    /// Open (or create) the database under `config.data_dir`
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DB_DIR);
        let db = sled::open(&path)?;
        info!("Opened chain database at {:?}", path);
        Ok(Self {
            db,
            config,
            commit_lock: RwLock::new(()),
        })
    }

    /// Open with default configuration
    pub fn with_defaults() -> Result<Self, StorageError> {
        Self::open(StorageConfig::default())
    }

    /// Write everything buffered to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // Unlocked readers, callers hold the commit lock as needed
    // =========================================================================

    fn latest_number(&self) -> Result<Option<u64>, StorageError> {
        self.db
            .get(keys::LATEST_BLOCK)?
            .map(|v| decode_number(&v))
            .transpose()
    }

    fn read_block(&self, number: u64) -> Result<Option<Block>, StorageError> {
        self.db
            .get(keys::block_by_number(number))?
            .map(|v| decode(&v))
            .transpose()
    }

    fn read_latest_block(&self) -> Result<Option<Block>, StorageError> {
        match self.latest_number()? {
            Some(number) => self.read_block(number),
            None => Ok(None),
        }
    }

    fn read_tx_by_hash(&self, hash: &Hash) -> Result<Option<ConfirmedTransaction>, StorageError> {
        self.db
            .get(keys::tx_by_hash(hash))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Follow a key whose value is a transaction hash
    fn read_tx_via(&self, key: &[u8]) -> Result<Option<ConfirmedTransaction>, StorageError> {
        match self.db.get(key)? {
            Some(hash) => self.read_tx_by_hash(&decode_hash(&hash)?),
            None => Ok(None),
        }
    }

    fn read_tx(
        &self,
        block_number: u64,
        transaction_index: u32,
    ) -> Result<Option<ConfirmedTransaction>, StorageError> {
        self.read_tx_via(&keys::tx_by_position(block_number, transaction_index))
    }

    fn read_block_transactions(
        &self,
        block_number: u64,
    ) -> Result<Vec<ConfirmedTransaction>, StorageError> {
        let mut txs = Vec::new();
        for entry in self.db.scan_prefix(keys::block_transactions(block_number)) {
            let (_, hash) = entry?;
            let hash = decode_hash(&hash)?;
            let tx = self.read_tx_by_hash(&hash)?.ok_or_else(|| {
                StorageError::Corrupt(format!("index points to missing tx {}", hex::encode(hash)))
            })?;
            txs.push(tx);
        }
        Ok(txs)
    }

    fn read_utxos(&self, owner: &Address) -> Result<Vec<Utxo>, StorageError> {
        let mut utxos = self
            .db
            .scan_prefix(keys::utxos_of(owner))
            .map(|entry| {
                let (_, value) = entry?;
                decode::<Utxo>(&value)
            })
            .collect::<Result<Vec<_>, _>>()?;
        utxos.sort_by_key(|u| u.position);
        Ok(utxos)
    }

    // =========================================================================
    // Write groups
    // =========================================================================

    /// Buffer the index updates of `txs`, which already carry their positions
    fn stage_transactions(
        &self,
        batch: &mut sled::Batch,
        txs: &[ConfirmedTransaction],
    ) -> Result<(), StorageError> {
        // outputs created earlier in the same group are not in the db yet
        let mut in_group: HashMap<(u64, u32), &ConfirmedTransaction> = HashMap::new();
        let mut claimed_positions: HashSet<OutputPosition> = HashSet::new();
        let mut claimed_nonces: HashSet<&BigUint> = HashSet::new();

        for confirmed in txs {
            let body = confirmed.body();
            let hash = confirmed.hash();

            batch.insert(keys::tx_by_hash(&hash), encode(confirmed)?);
            batch.insert(
                keys::tx_by_position(body.block_number, body.transaction_index),
                &hash[..],
            );

            if body.is_deposit() {
                let nonce = &body.input0.deposit_nonce;
                if !claimed_nonces.insert(nonce)
                    || self.db.contains_key(keys::deposit(nonce))?
                    || self.db.contains_key(keys::deposit_exit(nonce))?
                {
                    return Err(StorageError::DepositConsumed(nonce.clone()));
                }
                batch.insert(keys::deposit(nonce), &hash[..]);
            } else {
                for input in [&body.input0, &body.input1] {
                    if input.is_zero() {
                        continue;
                    }
                    let position = input.position();
                    if !claimed_positions.insert(position)
                        || self.db.contains_key(keys::spend(&position))?
                        || self.db.contains_key(keys::exit(&position))?
                    {
                        return Err(StorageError::DoubleSpend(position));
                    }
                    let spent = match in_group
                        .get(&(position.block_number, position.transaction_index))
                    {
                        Some(tx) => (*tx).clone(),
                        None => self
                            .read_tx(position.block_number, position.transaction_index)?
                            .ok_or(StorageError::MissingInput(position))?,
                    };
                    let owner = spent.body().output(position.output_index as usize).owner;

                    batch.insert(keys::spend(&position), &hash[..]);
                    batch.remove(keys::utxo(&owner, &spent.hash(), position.output_index));
                }
            }

            for (index, output) in body.outputs().into_iter().enumerate() {
                if output.is_zero() {
                    continue;
                }
                let output_index = index as u8;
                let utxo = Utxo {
                    position: confirmed.output_position(output_index),
                    tx_hash: hash,
                    output: output.clone(),
                };
                batch.insert(keys::utxo(&output.owner, &hash, output_index), encode(&utxo)?);
            }

            in_group.insert((body.block_number, body.transaction_index), confirmed);
        }
        Ok(())
    }

    /// Buffer the block records and move the latest pointer
    fn stage_block(
        &self,
        batch: &mut sled::Batch,
        block: &Block,
        metadata: &BlockMetadata,
    ) -> Result<(), StorageError> {
        let number = block.number();
        batch.insert(keys::block_by_number(number), encode(block)?);
        batch.insert(keys::block_by_hash(&block.block_hash), &number.to_be_bytes()[..]);
        batch.insert(keys::block_meta(number), encode(metadata)?);
        batch.insert(keys::LATEST_BLOCK, &number.to_be_bytes()[..]);
        Ok(())
    }

    /// Apply a block write group if the latest pointer is still `expected`
    ///
    /// The batch is written inside the transaction before the pointer is
    /// compared; an abort discards every write of the group.
    fn commit_block(&self, batch: sled::Batch, expected: Option<u64>) -> Result<(), StorageError> {
        let result = self.db.transaction(|tree| {
            let found = match tree.get(keys::LATEST_BLOCK)? {
                Some(v) => Some(decode_number(&v).map_err(ConflictableTransactionError::Abort)?),
                None => None,
            };
            tree.apply_batch(&batch)?;
            if found != expected {
                return Err(ConflictableTransactionError::Abort(StorageError::BlockRace {
                    expected,
                    found,
                }));
            }
            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }
        self.flush_if_configured()
    }

    fn apply(&self, batch: sled::Batch) -> Result<(), StorageError> {
        self.db.apply_batch(batch)?;
        self.flush_if_configured()
    }

    fn flush_if_configured(&self) -> Result<(), StorageError> {
        if self.config.flush_on_commit {
            self.db.flush()?;
        }
        Ok(())
    }
}

impl Storage for SledStorage {
    fn package_block(&self, txs: &[Transaction]) -> Result<BlockResult, StorageError> {
        if txs.is_empty() {
            return Err(StorageError::EmptyBatch);
        }
        let count = u32::try_from(txs.len()).map_err(|_| StorageError::BatchTooLarge(txs.len()))?;

        let _guard = self.commit_lock.write();
        let latest = self.read_latest_block()?;
        let (number, prev_hash) = match &latest {
            Some(block) => (block.number() + 1, block.block_hash),
            None => (FIRST_BLOCK_NUMBER, ZERO_HASH),
        };

        let leaves: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        let merkle_root = calculate_merkle_root(&leaves);

        let mut fees = BigInt::default();
        let mut packaged = Vec::with_capacity(txs.len());
        for (index, tx) in (0..count).zip(txs) {
            let mut tx = tx.clone();
            tx.body.block_number = number;
            tx.body.transaction_index = index;
            fees += &tx.body.fee;
            packaged.push(ConfirmedTransaction::unconfirmed(tx));
        }

        let block = Block::new(merkle_root, prev_hash, number);
        let metadata = BlockMetadata::new(count, fees.clone());

        let mut batch = sled::Batch::default();
        self.stage_transactions(&mut batch, &packaged)?;
        self.stage_block(&mut batch, &block, &metadata)?;
        self.commit_block(batch, latest.as_ref().map(Block::number))?;

        info!(
            "Packaged block {} with {} transaction(s), root 0x{}",
            number,
            count,
            hex::encode(merkle_root)
        );

        Ok(BlockResult {
            merkle_root,
            number_of_transactions: count,
            block_fees: fees,
            block_number: number,
        })
    }

    fn insert_block(
        &self,
        block: &Block,
        metadata: &BlockMetadata,
        txs: &[ConfirmedTransaction],
    ) -> Result<(), StorageError> {
        let _guard = self.commit_lock.write();
        let latest = self.read_latest_block()?;

        let (expected_number, expected_prev) = match &latest {
            Some(b) => (b.number() + 1, b.block_hash),
            None => (FIRST_BLOCK_NUMBER, ZERO_HASH),
        };
        if block.number() != expected_number {
            return Err(StorageError::NonSequentialBlock {
                latest: latest.as_ref().map(Block::number),
                got: block.number(),
            });
        }
        if block.header.prev_hash != expected_prev {
            return Err(StorageError::PrevHashMismatch(block.number()));
        }

        let mut batch = sled::Batch::default();
        self.stage_transactions(&mut batch, txs)?;
        self.stage_block(&mut batch, block, metadata)?;
        self.commit_block(batch, latest.as_ref().map(Block::number))?;

        info!("Inserted block {} with {} transaction(s)", block.number(), txs.len());
        Ok(())
    }

    fn confirm_transaction(
        &self,
        block_number: u64,
        transaction_index: u32,
        sigs: [Signature; 2],
    ) -> Result<ConfirmedTransaction, StorageError> {
        if sigs.iter().all(Signature::is_empty) {
            return Err(StorageError::EmptyConfirmation);
        }

        let _guard = self.commit_lock.write();
        let mut confirmed = self
            .read_tx(block_number, transaction_index)?
            .ok_or(StorageError::TransactionNotFound {
                block: block_number,
                index: transaction_index,
            })?;
        if confirmed.is_confirmed() {
            return Err(StorageError::AlreadyConfirmed {
                block: block_number,
                index: transaction_index,
            });
        }

        confirmed.confirm_sigs = sigs;
        let mut batch = sled::Batch::default();
        batch.insert(keys::tx_by_hash(&confirmed.hash()), encode(&confirmed)?);
        self.apply(batch)?;

        debug!("Confirmed transaction {}:{}", block_number, transaction_index);
        Ok(confirmed)
    }

    fn mark_as_exited(
        &self,
        position: &OutputPosition,
        eth_block_number: u64,
        eth_tx_hash: &Hash,
    ) -> Result<(), StorageError> {
        let _guard = self.commit_lock.write();
        let exited = self
            .read_tx(position.block_number, position.transaction_index)?
            .ok_or(StorageError::MissingInput(*position))?;
        let owner = exited.body().output(position.output_index as usize).owner;

        let locator = ExitLocator {
            exited: Input::spend(
                position.block_number,
                position.transaction_index,
                position.output_index,
            ),
            eth_block_number,
            eth_tx_hash: *eth_tx_hash,
        };

        let mut batch = sled::Batch::default();
        batch.remove(keys::utxo(&owner, &exited.hash(), position.output_index));
        batch.insert(keys::exit(position), encode(&locator)?);
        self.apply(batch)?;

        info!("Marked output {} as exited", position);
        Ok(())
    }

    fn mark_deposit_as_exited(
        &self,
        nonce: &BigUint,
        eth_block_number: u64,
        eth_tx_hash: &Hash,
    ) -> Result<(), StorageError> {
        let locator = ExitLocator {
            exited: Input::deposit(nonce.clone()),
            eth_block_number,
            eth_tx_hash: *eth_tx_hash,
        };

        let _guard = self.commit_lock.write();
        let mut batch = sled::Batch::default();
        batch.insert(keys::deposit_exit(nonce), encode(&locator)?);
        self.apply(batch)?;

        info!("Marked deposit {} as exited", nonce);
        Ok(())
    }

    fn is_double_spent(&self, tx: &Transaction) -> Result<bool, StorageError> {
        let body = &tx.body;
        let _guard = self.commit_lock.read();

        if body.is_deposit() {
            let nonce = &body.input0.deposit_nonce;
            return Ok(self.db.contains_key(keys::deposit(nonce))?
                || self.db.contains_key(keys::deposit_exit(nonce))?);
        }

        for input in [&body.input0, &body.input1] {
            if input.is_zero() {
                continue;
            }
            let position = input.position();
            if self.db.contains_key(keys::spend(&position))?
                || self.db.contains_key(keys::exit(&position))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn find_double_spending_transaction(
        &self,
        position: &OutputPosition,
    ) -> Result<Option<ConfirmedTransaction>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_tx_via(&keys::spend(position))
    }

    fn find_double_spending_deposit(
        &self,
        nonce: &BigUint,
    ) -> Result<Option<ConfirmedTransaction>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_tx_via(&keys::deposit(nonce))
    }

    fn exit_at(&self, position: &OutputPosition) -> Result<Option<ExitLocator>, StorageError> {
        self.db
            .get(keys::exit(position))?
            .map(|v| decode(&v))
            .transpose()
    }

    fn find_transaction(
        &self,
        block_number: u64,
        transaction_index: u32,
    ) -> Result<Option<ConfirmedTransaction>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_tx(block_number, transaction_index)
    }

    fn find_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<ConfirmedTransaction>, StorageError> {
        self.read_tx_by_hash(hash)
    }

    fn find_transactions_by_block(
        &self,
        block_number: u64,
    ) -> Result<Vec<ConfirmedTransaction>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_block_transactions(block_number)
    }

    fn latest_block(&self) -> Result<Option<Block>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_latest_block()
    }

    fn block_at_height(&self, number: u64) -> Result<Option<Block>, StorageError> {
        self.read_block(number)
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        let _guard = self.commit_lock.read();
        match self.db.get(keys::block_by_hash(hash))? {
            Some(number) => self.read_block(decode_number(&number)?),
            None => Ok(None),
        }
    }

    fn block_meta_at_height(&self, number: u64) -> Result<Option<BlockMetadata>, StorageError> {
        self.db
            .get(keys::block_meta(number))?
            .map(|v| decode(&v))
            .transpose()
    }

    fn full_block_at_height(&self, number: u64) -> Result<Option<FullBlock>, StorageError> {
        let _guard = self.commit_lock.read();
        let block = match self.read_block(number)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let metadata = self
            .db
            .get(keys::block_meta(number))?
            .map(|v| decode(&v))
            .transpose()?
            .ok_or_else(|| StorageError::Corrupt(format!("block {} has no metadata", number)))?;
        let transactions = self.read_block_transactions(number)?;

        Ok(Some(FullBlock {
            block,
            metadata,
            transactions,
        }))
    }

    fn utxos(&self, owner: &Address) -> Result<Vec<Utxo>, StorageError> {
        let _guard = self.commit_lock.read();
        self.read_utxos(owner)
    }

    fn spendable_outputs(&self, owner: &Address) -> Result<Vec<Utxo>, StorageError> {
        let _guard = self.commit_lock.read();
        let mut spendable = Vec::new();
        for utxo in self.read_utxos(owner)? {
            let confirmed = self
                .read_tx_by_hash(&utxo.tx_hash)?
                .map_or(false, |tx| tx.is_confirmed());
            if confirmed {
                spendable.push(utxo);
            }
        }
        Ok(spendable)
    }

    fn cursor(&self, cursor: Cursor) -> Result<u64, StorageError> {
        match self.db.get(keys::cursor(cursor.name()))? {
            Some(v) => decode_number(&v),
            None => Ok(0),
        }
    }

    fn save_cursor(&self, cursor: Cursor, value: u64) -> Result<(), StorageError> {
        self.db
            .insert(keys::cursor(cursor.name()), &value.to_be_bytes()[..])?;
        self.flush_if_configured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Output, TransactionBody};
    use crate::crypto::KeyPair;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SledStorage) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            flush_on_commit: false,
        };
        (dir, SledStorage::open(config).unwrap())
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

    fn spend_tx(from: &KeyPair, input: Input, outputs: [Output; 2]) -> Transaction {
        let [output0, output1] = outputs;
        let mut tx = Transaction::new(TransactionBody {
            input0: input,
            output0,
            output1,
            ..Default::default()
        });
        tx.sign_input(0, from);
        tx
    }

    #[test]
    fn test_package_first_block() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        assert!(storage.latest_block().unwrap().is_none());

        let tx = deposit_tx(1, &alice, 100);
        let result = storage.package_block(&[tx.clone()]).unwrap();
        assert_eq!(result.block_number, 1);
        assert_eq!(result.number_of_transactions, 1);
        assert_eq!(result.merkle_root, tx.hash());

        let latest = storage.latest_block().unwrap().unwrap();
        assert_eq!(latest.number(), 1);
        assert_eq!(latest.header.prev_hash, ZERO_HASH);

        let stored = storage.find_transaction(1, 0).unwrap().unwrap();
        assert_eq!(stored.body().block_number, 1);
        assert_eq!(stored.hash(), tx.hash());
        assert_eq!(storage.balance(&alice.address()).unwrap(), BigInt::from(100));
    }

    #[test]
    fn test_blocks_chain_by_prev_hash() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 10)]).unwrap();
        storage.package_block(&[deposit_tx(2, &alice, 10)]).unwrap();

        let first = storage.block_at_height(1).unwrap().unwrap();
        let second = storage.block_at_height(2).unwrap().unwrap();
        assert_eq!(second.header.prev_hash, first.block_hash);
        assert_eq!(
            storage.block_by_hash(&second.block_hash).unwrap(),
            Some(second)
        );
    }

    #[test]
    fn test_spend_updates_indices() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        storage.package_block(&[deposit_tx(1, &alice, 100)]).unwrap();
        let spend = spend_tx(
            &alice,
            Input::spend(1, 0, 0),
            [
                Output::new(bob.address(), 40),
                Output::new(alice.address(), 60),
            ],
        );
        assert!(!storage.is_double_spent(&spend).unwrap());
        storage.package_block(&[spend.clone()]).unwrap();

        assert!(storage.is_double_spent(&spend).unwrap());
        let spender = storage
            .find_double_spending_transaction(&OutputPosition::new(1, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(spender.hash(), spend.hash());

        let alice_utxos = storage.utxos(&alice.address()).unwrap();
        assert_eq!(alice_utxos.len(), 1);
        assert_eq!(alice_utxos[0].position, OutputPosition::new(2, 0, 1));
        assert_eq!(storage.balance(&bob.address()).unwrap(), BigInt::from(40));
    }

    #[test]
    fn test_deposit_index() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let deposit = deposit_tx(5, &alice, 10);
        assert!(!storage.is_double_spent(&deposit).unwrap());

        storage.package_block(&[deposit.clone()]).unwrap();
        assert!(storage.is_double_spent(&deposit).unwrap());
        assert!(storage
            .find_double_spending_deposit(&BigUint::from(5u32))
            .unwrap()
            .is_some());
        assert!(storage
            .find_double_spending_deposit(&BigUint::from(6u32))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_staged_block_without_commit_leaves_no_trace() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let mut tx = deposit_tx(1, &alice, 100);
        tx.body.block_number = 1;
        let packaged = vec![ConfirmedTransaction::unconfirmed(tx.clone())];

        // stop after buffering the block record and every output
        let mut batch = sled::Batch::default();
        storage.stage_transactions(&mut batch, &packaged).unwrap();
        storage
            .stage_block(&mut batch, &Block::new(tx.hash(), ZERO_HASH, 1), &BlockMetadata::new(1, BigInt::default()))
            .unwrap();
        drop(batch);

        assert!(storage.latest_block().unwrap().is_none());
        assert!(storage.find_transaction(1, 0).unwrap().is_none());
        assert!(storage.utxos(&alice.address()).unwrap().is_empty());
        assert!(!storage.is_double_spent(&tx).unwrap());

        let result = storage.package_block(&[tx]).unwrap();
        assert_eq!(result.block_number, 1);
    }

    #[test]
    fn test_commit_rejects_moved_latest_pointer() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 1)]).unwrap();

        let mut batch = sled::Batch::default();
        batch.insert(keys::LATEST_BLOCK, &7u64.to_be_bytes()[..]);
        let err = storage.commit_block(batch, None).unwrap_err();
        assert!(matches!(
            err,
            StorageError::BlockRace {
                expected: None,
                found: Some(1)
            }
        ));
        assert_eq!(storage.latest_block().unwrap().unwrap().number(), 1);
    }

    #[test]
    fn test_aborted_commit_discards_written_group() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 100)]).unwrap();

        let mut spend = spend_tx(
            &alice,
            Input::spend(1, 0, 0),
            [Output::new(bob.address(), 100), Output::zero()],
        );
        spend.body.block_number = 2;
        let packaged = vec![ConfirmedTransaction::unconfirmed(spend.clone())];
        let block = Block::new(spend.hash(), ZERO_HASH, 2);

        let mut batch = sled::Batch::default();
        storage.stage_transactions(&mut batch, &packaged).unwrap();
        storage
            .stage_block(&mut batch, &block, &BlockMetadata::new(1, BigInt::default()))
            .unwrap();

        // the group is written, then the stale pointer aborts it
        let err = storage.commit_block(batch, None).unwrap_err();
        assert!(matches!(err, StorageError::BlockRace { expected: None, found: Some(1) }));

        assert_eq!(storage.latest_block().unwrap().unwrap().number(), 1);
        assert!(storage.block_at_height(2).unwrap().is_none());
        assert!(storage.find_transaction(2, 0).unwrap().is_none());
        assert!(storage.find_transaction_by_hash(&spend.hash()).unwrap().is_none());
        assert!(storage
            .find_double_spending_transaction(&OutputPosition::new(1, 0, 0))
            .unwrap()
            .is_none());
        assert!(!storage.is_double_spent(&spend).unwrap());
        assert!(storage.utxos(&bob.address()).unwrap().is_empty());
        assert_eq!(storage.balance(&alice.address()).unwrap(), BigInt::from(100));
    }

    #[test]
    fn test_packaging_refuses_exited_output() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 100)]).unwrap();
        storage
            .mark_as_exited(&OutputPosition::new(1, 0, 0), 3, &[2u8; 32])
            .unwrap();

        let spend = spend_tx(
            &alice,
            Input::spend(1, 0, 0),
            [Output::new(bob.address(), 100), Output::zero()],
        );
        let err = storage.package_block(&[spend]).unwrap_err();
        assert!(matches!(err, StorageError::DoubleSpend(p) if p == OutputPosition::new(1, 0, 0)));
        assert_eq!(storage.latest_block().unwrap().unwrap().number(), 1);
        assert_eq!(storage.balance(&bob.address()).unwrap(), BigInt::from(0));
    }

    #[test]
    fn test_packaging_refuses_duplicate_claims() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 100)]).unwrap();

        let to_bob = spend_tx(
            &alice,
            Input::spend(1, 0, 0),
            [Output::new(bob.address(), 100), Output::zero()],
        );
        let to_carol = spend_tx(
            &alice,
            Input::spend(1, 0, 0),
            [Output::new(carol.address(), 100), Output::zero()],
        );
        let err = storage.package_block(&[to_bob.clone(), to_carol]).unwrap_err();
        assert!(matches!(err, StorageError::DoubleSpend(_)));
        assert!(storage.utxos(&bob.address()).unwrap().is_empty());
        assert!(storage.utxos(&carol.address()).unwrap().is_empty());

        // a committed spend also blocks a later batch
        storage.package_block(&[to_bob.clone()]).unwrap();
        assert!(matches!(
            storage.package_block(&[to_bob]),
            Err(StorageError::DoubleSpend(_))
        ));

        let replay = storage.package_block(&[deposit_tx(2, &alice, 1), deposit_tx(2, &alice, 1)]);
        assert!(matches!(replay, Err(StorageError::DepositConsumed(_))));
        assert!(matches!(
            storage.package_block(&[deposit_tx(1, &alice, 100)]),
            Err(StorageError::DepositConsumed(_))
        ));
        assert_eq!(storage.latest_block().unwrap().unwrap().number(), 2);
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            flush_on_commit: true,
        };
        let alice = KeyPair::generate();
        {
            let storage = SledStorage::open(config.clone()).unwrap();
            storage.package_block(&[deposit_tx(1, &alice, 70)]).unwrap();
            storage.save_cursor(Cursor::LastSubmittedBlock, 1).unwrap();
        }

        let storage = SledStorage::open(config).unwrap();
        assert_eq!(storage.latest_block().unwrap().unwrap().number(), 1);
        assert_eq!(storage.balance(&alice.address()).unwrap(), BigInt::from(70));
        assert_eq!(storage.cursor(Cursor::LastSubmittedBlock).unwrap(), 1);
        assert_eq!(storage.cursor(Cursor::DepositPoll).unwrap(), 0);
    }

    #[test]
    fn test_confirm_once() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 5)]).unwrap();
        assert!(storage.spendable_outputs(&alice.address()).unwrap().is_empty());

        let sig = alice.sign(&[1u8; 32]);
        let confirmed = storage
            .confirm_transaction(1, 0, [sig, Signature::EMPTY])
            .unwrap();
        assert!(confirmed.is_confirmed());
        assert_eq!(storage.spendable_outputs(&alice.address()).unwrap().len(), 1);

        let again = storage.confirm_transaction(1, 0, [sig, Signature::EMPTY]);
        assert!(matches!(again, Err(StorageError::AlreadyConfirmed { .. })));
        assert!(matches!(
            storage.confirm_transaction(9, 0, [sig, Signature::EMPTY]),
            Err(StorageError::TransactionNotFound { .. })
        ));
        assert!(matches!(
            storage.confirm_transaction(1, 0, [Signature::EMPTY; 2]),
            Err(StorageError::EmptyConfirmation)
        ));
    }

    #[test]
    fn test_mark_as_exited() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        storage.package_block(&[deposit_tx(1, &alice, 5)]).unwrap();

        let position = OutputPosition::new(1, 0, 0);
        storage.mark_as_exited(&position, 42, &[9u8; 32]).unwrap();

        assert!(storage.utxos(&alice.address()).unwrap().is_empty());
        let locator = storage.exit_at(&position).unwrap().unwrap();
        assert_eq!(locator.eth_block_number, 42);
        assert_eq!(locator.exited, Input::spend(1, 0, 0));

        let spend = spend_tx(&alice, Input::spend(1, 0, 0), [Output::new(alice.address(), 5), Output::zero()]);
        assert!(storage.is_double_spent(&spend).unwrap());
    }

    #[test]
    fn test_exited_deposit_counts_as_consumed() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        storage
            .mark_deposit_as_exited(&BigUint::from(3u32), 1, &[1u8; 32])
            .unwrap();
        assert!(storage.is_double_spent(&deposit_tx(3, &alice, 1)).unwrap());
    }

    #[test]
    fn test_insert_block_requires_next_number() {
        let (_dir, source) = open_temp();
        let (_dir2, follower) = open_temp();
        let alice = KeyPair::generate();
        source.package_block(&[deposit_tx(1, &alice, 5)]).unwrap();
        source.package_block(&[deposit_tx(2, &alice, 6)]).unwrap();

        let second = source.full_block_at_height(2).unwrap().unwrap();
        let err = follower
            .insert_block(&second.block, &second.metadata, &second.transactions)
            .unwrap_err();
        assert!(matches!(err, StorageError::NonSequentialBlock { latest: None, got: 2 }));

        for height in 1..=2 {
            let full = source.full_block_at_height(height).unwrap().unwrap();
            follower
                .insert_block(&full.block, &full.metadata, &full.transactions)
                .unwrap();
        }
        assert_eq!(follower.balance(&alice.address()).unwrap(), BigInt::from(11));
        assert_eq!(
            follower.latest_block().unwrap(),
            source.latest_block().unwrap()
        );
    }

    #[test]
    fn test_full_block_and_listing() {
        let (_dir, storage) = open_temp();
        let alice = KeyPair::generate();
        let txs: Vec<Transaction> = (1..=3).map(|n| deposit_tx(n, &alice, 1)).collect();
        storage.package_block(&txs).unwrap();

        let listed = storage.find_transactions_by_block(1).unwrap();
        assert_eq!(listed.len(), 3);
        for (index, tx) in listed.iter().enumerate() {
            assert_eq!(tx.body().transaction_index, index as u32);
        }

        let full = storage.full_block_at_height(1).unwrap().unwrap();
        assert_eq!(full.metadata.transaction_count, 3);
        assert!(storage.full_block_at_height(2).unwrap().is_none());
        assert!(storage.block_meta_at_height(1).unwrap().is_some());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (_dir, storage) = open_temp();
        assert!(matches!(storage.package_block(&[]), Err(StorageError::EmptyBatch)));
    }
}
