//! Operator node
//!
//! Orchestrates the transaction engine:
//! - the mempool admits validated transactions
//! - a packaging loop periodically turns the pool into a block
//! - the block submitter publishes blocks to the base chain
//! - the deposit watcher follows new base-chain deposits
//! - the exit watcher challenges fraudulent exits

pub mod confirmer;
pub mod deposits;
pub mod exits;
pub mod mempool;
pub mod submitter;

use crate::core::BlockResult;
use crate::rootchain::{RootChain, RootChainError};
use crate::storage::{Storage, StorageConfig, StorageError};
use crate::validation::ValidationError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use confirmer::TransactionConfirmer;
pub use deposits::{DepositReport, DepositWatcher};
pub use exits::{ExitReport, ExitWatcher};
pub use mempool::{InclusionReceipt, MempoolConfig, MempoolError, MempoolHandle, MAX_MEMPOOL_SIZE};
pub use submitter::BlockSubmitter;

// =============================================================================
// Error Types
// =============================================================================

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Base chain error: {0}")]
    RootChain(#[from] RootChainError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Period of the packaging loop
    pub flush_interval: Duration,
    /// Pause between failed block submissions
    pub submit_retry_delay: Duration,
    /// Period of the deposit and exit watchers
    pub exit_poll_interval: Duration,
    pub storage: StorageConfig,
    pub mempool: MempoolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            submit_retry_delay: Duration::from_secs(1),
            exit_poll_interval: Duration::from_secs(5),
            storage: StorageConfig::default(),
            mempool: MempoolConfig::default(),
        }
    }
}

// =============================================================================
// Packaging
// =============================================================================

/// Package every pending transaction into the next block
///
/// The block is committed and queued for submission before any submitter
/// learns its receipt. On failure every waiter receives the same error.
pub async fn package_pending(
    mempool: &MempoolHandle,
    storage: &Arc<dyn Storage>,
    submitter: &BlockSubmitter,
) -> Result<Option<BlockResult>, MempoolError> {
    let batch = mempool.flush().await?;
    if batch.is_empty() {
        return Ok(None);
    }

    let txs = batch.transactions();
    let store = Arc::clone(storage);
    let outcome = match tokio::task::spawn_blocking(move || store.package_block(&txs)).await {
        Ok(result) => result.map_err(Arc::new),
        Err(e) => Err(Arc::new(StorageError::Interrupted(e.to_string()))),
    };

    match &outcome {
        Ok(result) => {
            submitter.enqueue(result.clone());
            log::info!(
                "Packaged block {} with {} transactions",
                result.block_number,
                result.number_of_transactions
            );
        }
        Err(e) => log::error!("Failed to package {} transactions: {}", batch.len(), e),
    }
    batch.resolve(outcome.as_ref());

    outcome.map(Some).map_err(MempoolError::PackagingFailed)
}

async fn packaging_loop(
    mempool: MempoolHandle,
    storage: Arc<dyn Storage>,
    submitter: BlockSubmitter,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match package_pending(&mempool, &storage, &submitter).await {
                    Ok(_) | Err(MempoolError::PackagingFailed(_)) => {}
                    Err(e) => {
                        log::warn!("Packaging loop stopped: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Packaging loop stopped");
}

async fn watch_loop(
    deposits: DepositWatcher,
    exits: ExitWatcher,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let round = deposits.clone();
                match tokio::task::spawn_blocking(move || round.poll()).await {
                    Ok(Ok(report)) if report.found > 0 => {
                        log::info!(
                            "Deposit poll: {} found, {} not yet on the plasma chain",
                            report.found,
                            report.unclaimed.len()
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::warn!("Deposit poll failed: {}", e),
                    Err(e) => log::warn!("Deposit poll task failed: {}", e),
                }

                let round = exits.clone();
                match tokio::task::spawn_blocking(move || round.poll()).await {
                    Ok(Ok(report)) if report != ExitReport::default() => {
                        log::info!(
                            "Exit poll: {} exited, {} challenged, {} skipped",
                            report.exited,
                            report.challenged,
                            report.skipped
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::warn!("Exit poll failed: {}", e),
                    Err(e) => log::warn!("Exit poll task failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Base-chain watchers stopped");
}

// =============================================================================
// Node
// =============================================================================

/// A running operator node
pub struct Node {
    pub config: NodeConfig,
    storage: Arc<dyn Storage>,
    mempool: MempoolHandle,
    confirmer: TransactionConfirmer,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start every background service; must be called inside a tokio runtime
    pub fn start(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        root_chain: Arc<dyn RootChain>,
    ) -> Result<Self, NodeError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (submitter, submit_task) = BlockSubmitter::start(
            Arc::clone(&storage),
            Arc::clone(&root_chain),
            config.submit_retry_delay,
            shutdown_rx.clone(),
        )?;
        let (mempool, admission_task) = mempool::start(
            &config.mempool,
            Arc::clone(&storage),
            Arc::clone(&root_chain),
        );

        let packaging_task = tokio::spawn(packaging_loop(
            mempool.clone(),
            Arc::clone(&storage),
            submitter,
            config.flush_interval,
            shutdown_rx.clone(),
        ));
        let watch_task = tokio::spawn(watch_loop(
            DepositWatcher::new(Arc::clone(&storage), Arc::clone(&root_chain)),
            ExitWatcher::new(Arc::clone(&storage), Arc::clone(&root_chain)),
            config.exit_poll_interval,
            shutdown_rx,
        ));

        log::info!(
            "Node started (flush every {:?}, mempool capacity {})",
            config.flush_interval,
            config.mempool.capacity
        );

        Ok(Self {
            confirmer: TransactionConfirmer::new(Arc::clone(&storage), root_chain),
            config,
            storage,
            mempool,
            shutdown_tx,
            tasks: vec![submit_task, admission_task, packaging_task, watch_task],
        })
    }

    pub fn mempool(&self) -> &MempoolHandle {
        &self.mempool
    }

    pub fn confirmer(&self) -> &TransactionConfirmer {
        &self.confirmer
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Stop the background services and wait for them to finish
    pub async fn shutdown(self) -> Result<(), NodeError> {
        log::info!("Node shutting down...");
        let _ = self.shutdown_tx.send(true);

        let Node { tasks, mempool, .. } = self;
        // the admission worker ends once every handle is gone
        drop(mempool);
        for joined in futures::future::join_all(tasks).await {
            joined.map_err(|e| NodeError::TaskFailed(e.to_string()))?;
        }
        Ok(())
    }
}
