//! Storage contracts for the scheduler queue and the executor's broadcaster
//! cursors / pending transactions. Drivers live behind these traits; the
//! engine only sees `Arc<dyn …Storage>`.

use async_trait::async_trait;
use primitive_types::{H160, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::ChainId;
use crate::execution::{ArchiveReason, ExecutionKey, QueuedExecution};
use crate::transaction::{Broadcaster, PendingTransaction};

pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A queued execution after it left the live queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedExecution {
    pub execution: QueuedExecution,
    pub reason: ArchiveReason,
}

/// Per-chain fee bookkeeping shared between worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfiguration {
    pub chain_id: ChainId,
    pub expected_worst_case_gas_price: Option<U256>,
    pub expected_worst_case_gas_price_update_time: Option<u64>,
    pub fees: Option<ChainFees>,
    pub fees_update_time: Option<u64>,
}

impl ChainConfiguration {
    pub fn empty(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            expected_worst_case_gas_price: None,
            expected_worst_case_gas_price_update_time: None,
            fees: None,
            fees_update_time: None,
        }
    }
}

/// Store for queued and archived scheduled executions, keyed by
/// (chain, account, slot).
#[async_trait]
pub trait SchedulerStorage: Send + Sync {
    async fn get_queued_execution(
        &self,
        key: &ExecutionKey,
    ) -> StorageResult<Option<QueuedExecution>>;

    async fn get_queued_executions_for_account(
        &self,
        chain_id: ChainId,
        account: H160,
    ) -> StorageResult<Vec<QueuedExecution>>;

    async fn delete_execution(&self, key: &ExecutionKey) -> StorageResult<()>;

    /// Move an entry to the archive store and remove it from the live queue.
    async fn archive_execution(
        &self,
        execution: &QueuedExecution,
        reason: ArchiveReason,
    ) -> StorageResult<()>;

    async fn create_or_update_queued_execution(
        &self,
        execution: &QueuedExecution,
    ) -> StorageResult<()>;

    /// Up to `limit` entries ordered by `checkin_time` ascending.
    async fn get_queue_topmost_executions(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>>;

    /// Entries flagged broadcasted but not finalized; non-empty only after a
    /// crash between hand-off and deletion.
    async fn get_unfinalized_broadcasted_executions(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>>;

    async fn get_account_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>>;

    async fn get_account_archived_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> StorageResult<Vec<ArchivedExecution>>;

    async fn clear(&self) -> StorageResult<()>;

    async fn setup(&self) -> StorageResult<()>;
}

/// Store for broadcaster cursors (with their lock rows) and in-flight
/// pending transactions, indexed by next-check time.
#[async_trait]
pub trait ExecutorStorage: Send + Sync {
    async fn get_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<Option<PendingTransaction>>;

    /// A pending transaction that already settled and left the live index.
    /// The hand-off dedupe consults this too: a replay after finalization
    /// must not look like a new execution.
    async fn get_archived_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<Option<PendingTransaction>>;

    async fn get_pending_executions_per_broadcaster(
        &self,
        chain_id: ChainId,
        broadcaster: H160,
    ) -> StorageResult<Vec<PendingTransaction>>;

    async fn create_or_update_pending_execution(
        &self,
        pending: &PendingTransaction,
    ) -> StorageResult<()>;

    async fn delete_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<()>;

    /// Move a pending transaction out of the live index once it settled.
    async fn archive_pending_execution(
        &self,
        pending: &PendingTransaction,
        reason: ArchiveReason,
    ) -> StorageResult<()>;

    /// Up to `limit` pending transactions ordered by `next_check_time`
    /// ascending.
    async fn get_pending_executions(&self, limit: usize)
        -> StorageResult<Vec<PendingTransaction>>;

    async fn get_all_executions(&self, limit: usize) -> StorageResult<Vec<PendingTransaction>>;

    async fn get_broadcaster(
        &self,
        chain_id: ChainId,
        address: H160,
    ) -> StorageResult<Option<Broadcaster>>;

    async fn create_broadcaster(&self, broadcaster: &Broadcaster) -> StorageResult<()>;

    /// Persist cursor changes. Callers must hold the broadcaster lock; the
    /// driver does not re-verify it.
    async fn update_broadcaster(&self, broadcaster: &Broadcaster) -> StorageResult<()>;

    /// Conditional write: set the lock to `token` if the row is unlocked or
    /// its current lock is older than `stale_after` seconds. Returns the row
    /// with the lock held on success, `None` on contention. Creates the row
    /// (cursor 0) if it does not exist.
    async fn acquire_broadcaster_lock(
        &self,
        chain_id: ChainId,
        address: H160,
        token: Uuid,
        now: u64,
        stale_after: u64,
    ) -> StorageResult<Option<Broadcaster>>;

    /// Clears the lock only if it still carries `token`; a takeover by
    /// another worker after a stale timeout must not be undone.
    async fn release_broadcaster_lock(
        &self,
        chain_id: ChainId,
        address: H160,
        token: Uuid,
    ) -> StorageResult<()>;

    async fn get_chain_configuration(
        &self,
        chain_id: ChainId,
    ) -> StorageResult<Option<ChainConfiguration>>;

    async fn update_expected_worst_case_gas_price(
        &self,
        chain_id: ChainId,
        price: U256,
        timestamp: u64,
    ) -> StorageResult<()>;

    async fn update_fees(
        &self,
        chain_id: ChainId,
        fees: &ChainFees,
        timestamp: u64,
    ) -> StorageResult<()>;

    async fn clear(&self) -> StorageResult<()>;

    async fn setup(&self) -> StorageResult<()>;
}
