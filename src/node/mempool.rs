//! Transaction pool (mempool) for pending transactions
//!
//! Admission runs in two stages:
//! - storage validation, concurrently, bounded by a pool of validation permits
//! - pool admission, on a single worker task that owns the set of outputs
//!   claimed by pending transactions
//!
//! `append` resolves exactly once: with the inclusion receipt after the
//! transaction's block is committed, or with the error that stopped it.
//! Transactions are indexed in the order the admission worker accepted them;
//! there is no ordering guarantee across concurrent submitters.

use crate::core::{BlockResult, Hash, Transaction};
use crate::rootchain::RootChain;
use crate::storage::{Storage, StorageError};
use crate::validation::{validate_transaction, ValidationError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

// =============================================================================
// Configuration
// =============================================================================

/// Hard limit of transactions waiting in the pool
pub const MAX_MEMPOOL_SIZE: usize = 65_534;

/// Default number of concurrent validations
pub const DEFAULT_VALIDATION_WORKERS: usize = 8;

/// Depth of the request queue of the admission worker
const REQUEST_QUEUE_SIZE: usize = 1024;

/// Mempool configuration
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub capacity: usize,
    pub validation_workers: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_MEMPOOL_SIZE,
            validation_workers: DEFAULT_VALIDATION_WORKERS,
        }
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Mempool errors
#[derive(Error, Debug, Clone)]
pub enum MempoolError {
    #[error("Mempool full")]
    MempoolFull,
    #[error("Transaction rejected: {0}")]
    Rejected(Arc<ValidationError>),
    #[error("Validation could not complete: {0}")]
    ValidationFailed(Arc<ValidationError>),
    #[error("Block packaging failed: {0}")]
    PackagingFailed(Arc<StorageError>),
    #[error("Mempool stopped")]
    Stopped,
}

impl From<ValidationError> for MempoolError {
    fn from(err: ValidationError) -> Self {
        if err.is_rejection() {
            MempoolError::Rejected(Arc::new(err))
        } else {
            MempoolError::ValidationFailed(Arc::new(err))
        }
    }
}

impl MempoolError {
    /// True when the transaction lost to an earlier spend of the same input
    pub fn is_double_spend(&self) -> bool {
        match self {
            MempoolError::Rejected(e) => matches!(**e, ValidationError::DoubleSpent),
            MempoolError::PackagingFailed(e) => matches!(
                **e,
                StorageError::DoubleSpend(_) | StorageError::DepositConsumed(_)
            ),
            _ => false,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Where a packaged transaction ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionReceipt {
    #[serde(with = "crate::crypto::hex_bytes")]
    pub merkle_root: Hash,
    pub block_number: u64,
    pub transaction_index: u32,
}

type Responder = oneshot::Sender<Result<InclusionReceipt, MempoolError>>;

struct PendingTx {
    tx: Transaction,
    responder: Responder,
}

enum Request {
    Admit { tx: Transaction, responder: Responder },
    Flush { reply: oneshot::Sender<FlushedBatch> },
}

/// Pending transactions taken out of the pool for packaging
///
/// The admission worker stays paused until the batch is resolved or dropped,
/// so no transaction is admitted against a state that packaging is changing.
pub struct FlushedBatch {
    pending: Vec<PendingTx>,
    _resume: oneshot::Sender<()>,
}

impl FlushedBatch {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Transactions in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.pending.iter().map(|p| p.tx.clone()).collect()
    }

    /// Deliver the packaging outcome to every waiting submitter
    pub fn resolve(self, outcome: Result<&BlockResult, &Arc<StorageError>>) {
        for (index, pending) in self.pending.into_iter().enumerate() {
            let response = match outcome {
                Ok(result) => Ok(InclusionReceipt {
                    merkle_root: result.merkle_root,
                    block_number: result.block_number,
                    transaction_index: index as u32,
                }),
                Err(err) => Err(MempoolError::PackagingFailed(Arc::clone(err))),
            };
            // the submitter may have given up waiting
            let _ = pending.responder.send(response);
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Releases a capacity slot when the submission resolves
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cloneable entry point of the mempool
#[derive(Clone)]
pub struct MempoolHandle {
    requests: mpsc::Sender<Request>,
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
    validators: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

impl MempoolHandle {
    /// Submit a transaction and wait until it is packaged or rejected
    pub async fn append(&self, tx: Transaction) -> Result<InclusionReceipt, MempoolError> {
        let _slot = self.reserve()?;

        {
            let _permit = self
                .validators
                .acquire()
                .await
                .map_err(|_| MempoolError::Stopped)?;
            let storage = Arc::clone(&self.storage);
            let root_chain = Arc::clone(&self.root_chain);
            let candidate = tx.clone();
            tokio::task::spawn_blocking(move || {
                validate_transaction(storage.as_ref(), root_chain.as_ref(), &candidate)
            })
            .await
            .map_err(|_| MempoolError::Stopped)??;
        }

        let (responder, response) = oneshot::channel();
        self.requests
            .send(Request::Admit { tx, responder })
            .await
            .map_err(|_| MempoolError::Stopped)?;
        response.await.map_err(|_| MempoolError::Stopped)?
    }

    /// Take every pending transaction out of the pool
    pub async fn flush(&self) -> Result<FlushedBatch, MempoolError> {
        let (reply, batch) = oneshot::channel();
        self.requests
            .send(Request::Flush { reply })
            .await
            .map_err(|_| MempoolError::Stopped)?;
        batch.await.map_err(|_| MempoolError::Stopped)
    }

    /// Submissions currently being validated or waiting for a block
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> Result<Slot, MempoolError> {
        let capacity = self.capacity;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| MempoolError::MempoolFull)?;
        Ok(Slot(Arc::clone(&self.in_flight)))
    }
}

// =============================================================================
// Admission Worker
// =============================================================================

/// Pool-spend key of every real input
///
/// Deposits are keyed by nonce alone and spends by `block:index:output`, so
/// two encodings of the same output claim the same key.
fn spend_keys(tx: &Transaction) -> Vec<String> {
    [&tx.body.input0, &tx.body.input1]
        .into_iter()
        .filter(|input| !input.is_zero())
        .map(|input| {
            if input.is_deposit() {
                format!("deposit:{}", input.deposit_nonce)
            } else {
                input.position().to_string()
            }
        })
        .collect()
}

struct AdmissionWorker {
    requests: mpsc::Receiver<Request>,
    storage: Arc<dyn Storage>,
    pending: Vec<PendingTx>,
    pool_spends: HashSet<String>,
    capacity: usize,
}

impl AdmissionWorker {
    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                Request::Admit { tx, responder } => self.admit(tx, responder),
                Request::Flush { reply } => {
                    let (resume, resumed) = oneshot::channel();
                    let batch = FlushedBatch {
                        pending: std::mem::take(&mut self.pending),
                        _resume: resume,
                    };
                    self.pool_spends.clear();
                    if reply.send(batch).is_ok() {
                        // completes when the batch is resolved or dropped
                        let _ = resumed.await;
                    }
                }
            }
        }
        debug!("Admission worker stopped");
    }

    fn admit(&mut self, tx: Transaction, responder: Responder) {
        if self.pending.len() >= self.capacity {
            let _ = responder.send(Err(MempoolError::MempoolFull));
            return;
        }

        let keys = spend_keys(&tx);
        if keys.iter().any(|key| self.pool_spends.contains(key)) {
            debug!("Rejected transaction claiming a pending input");
            let _ = responder.send(Err(ValidationError::DoubleSpent.into()));
            return;
        }

        // a block may have been packaged since validation ran
        match self.storage.is_double_spent(&tx) {
            Ok(false) => {}
            Ok(true) => {
                let _ = responder.send(Err(ValidationError::DoubleSpent.into()));
                return;
            }
            Err(err) => {
                let _ = responder.send(Err(ValidationError::from(err).into()));
                return;
            }
        }

        self.pool_spends.extend(keys);
        self.pending.push(PendingTx { tx, responder });
    }
}

/// Start the admission worker
pub fn start(
    config: &MempoolConfig,
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
) -> (MempoolHandle, JoinHandle<()>) {
    let (requests, receiver) = mpsc::channel(REQUEST_QUEUE_SIZE);
    let worker = AdmissionWorker {
        requests: receiver,
        storage: Arc::clone(&storage),
        pending: Vec::new(),
        pool_spends: HashSet::new(),
        capacity: config.capacity,
    };
    let task = tokio::spawn(worker.run());

    let handle = MempoolHandle {
        requests,
        storage,
        root_chain,
        validators: Arc::new(Semaphore::new(config.validation_workers.max(1))),
        in_flight: Arc::new(AtomicUsize::new(0)),
        capacity: config.capacity,
    };
    (handle, task)
}
