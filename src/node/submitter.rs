//! Block submitter
//!
//! Publishes packaged blocks to the base chain strictly in block order. A
//! failed submission is retried after a delay and blocks the queue behind it.
//! The last acknowledged block number is persisted, so a restarted node
//! resubmits everything after it.

use crate::core::BlockResult;
use crate::rootchain::RootChain;
use crate::storage::{Cursor, Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Queue of packaged blocks waiting for the base chain
#[derive(Clone)]
pub struct BlockSubmitter {
    queue: mpsc::UnboundedSender<BlockResult>,
}

impl BlockSubmitter {
    /// Start the submission task, re-queueing blocks the base chain never
    /// acknowledged
    pub fn start(
        storage: Arc<dyn Storage>,
        root_chain: Arc<dyn RootChain>,
        retry_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), StorageError> {
        let (queue, receiver) = mpsc::unbounded_channel();

        let last_submitted = storage.cursor(Cursor::LastSubmittedBlock)?;
        let latest = storage.latest_block()?.map_or(0, |b| b.number());
        for number in last_submitted + 1..=latest {
            let result = stored_block_result(storage.as_ref(), number)?;
            // the receiver is still in scope
            let _ = queue.send(result);
        }
        if latest > last_submitted {
            log::info!(
                "Resubmitting blocks {}..={} to the base chain",
                last_submitted + 1,
                latest
            );
        }

        let worker = SubmitWorker {
            receiver,
            storage,
            root_chain,
            retry_delay,
            shutdown,
        };
        let task = tokio::spawn(worker.run());
        Ok((Self { queue }, task))
    }

    /// Queue a freshly packaged block
    pub fn enqueue(&self, result: BlockResult) {
        let number = result.block_number;
        if self.queue.send(result).is_err() {
            log::warn!("Block submitter stopped; block {} not queued", number);
        }
    }
}

/// Rebuild the submission record of a committed block
fn stored_block_result(storage: &dyn Storage, number: u64) -> Result<BlockResult, StorageError> {
    let block = storage
        .block_at_height(number)?
        .ok_or_else(|| StorageError::Corrupt(format!("block {} missing", number)))?;
    let meta = storage
        .block_meta_at_height(number)?
        .ok_or_else(|| StorageError::Corrupt(format!("metadata of block {} missing", number)))?;
    Ok(BlockResult {
        merkle_root: *block.merkle_root(),
        number_of_transactions: meta.transaction_count,
        block_fees: meta.fees,
        block_number: number,
    })
}

struct SubmitWorker {
    receiver: mpsc::UnboundedReceiver<BlockResult>,
    storage: Arc<dyn Storage>,
    root_chain: Arc<dyn RootChain>,
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SubmitWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                next = self.receiver.recv() => match next {
                    Some(result) => {
                        if !self.submit(result).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.shutdown.changed() => break,
            }
        }
        log::debug!("Block submitter stopped");
    }

    /// Submit until acknowledged; false if shutdown interrupted the retries
    async fn submit(&mut self, result: BlockResult) -> bool {
        let number = result.block_number;
        loop {
            let root_chain = Arc::clone(&self.root_chain);
            let block = result.clone();
            let outcome =
                tokio::task::spawn_blocking(move || root_chain.submit_block(&block)).await;

            match outcome {
                Ok(Ok(())) => {
                    if let Err(e) = self.storage.save_cursor(Cursor::LastSubmittedBlock, number) {
                        log::warn!("Failed to record submission of block {}: {}", number, e);
                    }
                    log::info!(
                        "Submitted block {} ({} transactions)",
                        number,
                        result.number_of_transactions
                    );
                    return true;
                }
                Ok(Err(e)) => log::warn!("Submission of block {} failed: {}", number, e),
                Err(e) => log::warn!("Submission task for block {} failed: {}", number, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.shutdown.changed() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Input, Output, Transaction, TransactionBody};
    use crate::crypto::KeyPair;
    use crate::rootchain::MemoryRootChain;
    use crate::storage::{SledStorage, StorageConfig};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<dyn Storage> {
        Arc::new(
            SledStorage::open(StorageConfig {
                data_dir: dir.path().to_path_buf(),
                flush_on_commit: true,
            })
            .unwrap(),
        )
    }

    fn package(storage: &dyn Storage, nonce: u32) -> BlockResult {
        let owner = KeyPair::generate();
        let tx = Transaction::new(TransactionBody {
            input0: Input::deposit(nonce),
            output0: Output::new(owner.address(), 1),
            ..Default::default()
        });
        storage.package_block(&[tx]).unwrap()
    }

    async fn wait_for_submissions(root: &MemoryRootChain, count: usize) {
        for _ in 0..400 {
            if root.submitted_blocks().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} submitted blocks", count);
    }

    #[tokio::test]
    async fn test_retries_until_accepted() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let root = Arc::new(MemoryRootChain::new());
        root.fail_next_submissions(2);
        let (_stop, shutdown) = watch::channel(false);

        let (submitter, _task) = BlockSubmitter::start(
            storage.clone(),
            root.clone(),
            Duration::from_millis(5),
            shutdown,
        )
        .unwrap();
        let result = package(storage.as_ref(), 1);
        submitter.enqueue(result.clone());

        wait_for_submissions(&root, 1).await;
        assert_eq!(root.submitted_blocks(), vec![result]);
        for _ in 0..100 {
            if storage.cursor(Cursor::LastSubmittedBlock).unwrap() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("submission cursor not saved");
    }

    #[tokio::test]
    async fn test_resumes_after_last_submitted() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let first = package(storage.as_ref(), 1);
        let second = package(storage.as_ref(), 2);
        let third = package(storage.as_ref(), 3);

        // block 1 reached the base chain before the restart
        let root = Arc::new(MemoryRootChain::new());
        root.submit_block(&first).unwrap();
        storage.save_cursor(Cursor::LastSubmittedBlock, 1).unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let (_submitter, _task) =
            BlockSubmitter::start(storage.clone(), root.clone(), Duration::from_millis(5), shutdown)
                .unwrap();

        wait_for_submissions(&root, 3).await;
        assert_eq!(root.submitted_blocks(), vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retries() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let root = Arc::new(MemoryRootChain::new());
        root.fail_next_submissions(usize::MAX);
        let (stop, shutdown) = watch::channel(false);

        let (submitter, task) =
            BlockSubmitter::start(storage.clone(), root.clone(), Duration::from_millis(5), shutdown)
                .unwrap();
        submitter.enqueue(package(storage.as_ref(), 1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.send(true).unwrap();
        task.await.unwrap();
        assert!(root.submitted_blocks().is_empty());
        assert_eq!(storage.cursor(Cursor::LastSubmittedBlock).unwrap(), 0);
    }
}
