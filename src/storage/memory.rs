//! In-memory driver for both storage contracts. Used by every scenario test
//! and usable as a single-process driver; durable drivers live outside this
//! crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use itertools::Itertools;
use primitive_types::{H160, U256};
use uuid::Uuid;

use crate::chain::ChainId;
use crate::execution::{ArchiveReason, ExecutionKey, QueuedExecution};
use crate::transaction::{Broadcaster, BroadcasterLock, PendingTransaction};

use super::{
    ArchivedExecution, ChainConfiguration, ChainFees, ExecutorStorage, SchedulerStorage,
    StorageError, StorageResult,
};

type PendingKey = (ExecutionKey, u32);

#[derive(Default)]
struct SchedulerTables {
    queue: HashMap<ExecutionKey, QueuedExecution>,
    archive: HashMap<ExecutionKey, ArchivedExecution>,
}

#[derive(Default)]
struct ExecutorTables {
    pending: HashMap<PendingKey, PendingTransaction>,
    archived: HashMap<PendingKey, (PendingTransaction, ArchiveReason)>,
    broadcasters: HashMap<(ChainId, H160), Broadcaster>,
    chain_configurations: HashMap<ChainId, ChainConfiguration>,
}

/// Single-process store backed by mutex-guarded maps. The broadcaster-lock
/// conditional write happens under the table mutex, which makes it atomic
/// with respect to every other accessor of this store.
#[derive(Default)]
pub struct MemoryStorage {
    scheduler: Mutex<SchedulerTables>,
    executor: Mutex<ExecutorTables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn scheduler_tables(&self) -> StorageResult<std::sync::MutexGuard<'_, SchedulerTables>> {
        self.scheduler
            .lock()
            .map_err(|_| StorageError::Backend("scheduler table mutex poisoned".to_string()))
    }

    fn executor_tables(&self) -> StorageResult<std::sync::MutexGuard<'_, ExecutorTables>> {
        self.executor
            .lock()
            .map_err(|_| StorageError::Backend("executor table mutex poisoned".to_string()))
    }
}

#[async_trait]
impl SchedulerStorage for MemoryStorage {
    async fn get_queued_execution(
        &self,
        key: &ExecutionKey,
    ) -> StorageResult<Option<QueuedExecution>> {
        Ok(self.scheduler_tables()?.queue.get(key).cloned())
    }

    async fn get_queued_executions_for_account(
        &self,
        chain_id: ChainId,
        account: H160,
    ) -> StorageResult<Vec<QueuedExecution>> {
        let tables = self.scheduler_tables()?;
        Ok(tables
            .queue
            .values()
            .filter(|e| e.key.chain_id == chain_id && e.key.account == account)
            .cloned()
            .sorted_by_key(|e| e.checkin_time)
            .collect())
    }

    async fn delete_execution(&self, key: &ExecutionKey) -> StorageResult<()> {
        self.scheduler_tables()?.queue.remove(key);
        Ok(())
    }

    async fn archive_execution(
        &self,
        execution: &QueuedExecution,
        reason: ArchiveReason,
    ) -> StorageResult<()> {
        let mut tables = self.scheduler_tables()?;
        tables.queue.remove(&execution.key);
        tables.archive.insert(
            execution.key.clone(),
            ArchivedExecution {
                execution: execution.clone(),
                reason,
            },
        );
        Ok(())
    }

    async fn create_or_update_queued_execution(
        &self,
        execution: &QueuedExecution,
    ) -> StorageResult<()> {
        self.scheduler_tables()?
            .queue
            .insert(execution.key.clone(), execution.clone());
        Ok(())
    }

    async fn get_queue_topmost_executions(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>> {
        let tables = self.scheduler_tables()?;
        Ok(tables
            .queue
            .values()
            .cloned()
            .sorted_by(|a, b| {
                a.checkin_time
                    .cmp(&b.checkin_time)
                    .then_with(|| a.key.cmp(&b.key))
            })
            .take(limit)
            .collect())
    }

    async fn get_unfinalized_broadcasted_executions(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>> {
        let tables = self.scheduler_tables()?;
        Ok(tables
            .queue
            .values()
            .filter(|e| e.broadcasted && !e.finalized)
            .cloned()
            .sorted_by_key(|e| e.checkin_time)
            .take(limit)
            .collect())
    }

    async fn get_account_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> StorageResult<Vec<QueuedExecution>> {
        Ok(self
            .get_queued_executions_for_account(chain_id, account)
            .await?
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn get_account_archived_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> StorageResult<Vec<ArchivedExecution>> {
        let tables = self.scheduler_tables()?;
        Ok(tables
            .archive
            .values()
            .filter(|a| a.execution.key.chain_id == chain_id && a.execution.key.account == account)
            .cloned()
            .sorted_by_key(|a| a.execution.checkin_time)
            .take(limit)
            .collect())
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut tables = self.scheduler_tables()?;
        tables.queue.clear();
        tables.archive.clear();
        Ok(())
    }

    async fn setup(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ExecutorStorage for MemoryStorage {
    async fn get_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<Option<PendingTransaction>> {
        Ok(self
            .executor_tables()?
            .pending
            .get(&(key.clone(), batch_index))
            .cloned())
    }

    async fn get_archived_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<Option<PendingTransaction>> {
        Ok(self
            .executor_tables()?
            .archived
            .get(&(key.clone(), batch_index))
            .map(|(pending, _)| pending.clone()))
    }

    async fn get_pending_executions_per_broadcaster(
        &self,
        chain_id: ChainId,
        broadcaster: H160,
    ) -> StorageResult<Vec<PendingTransaction>> {
        let tables = self.executor_tables()?;
        Ok(tables
            .pending
            .values()
            .filter(|p| p.key.chain_id == chain_id && p.broadcaster == broadcaster)
            .cloned()
            .sorted_by_key(|p| p.nonce)
            .collect())
    }

    async fn create_or_update_pending_execution(
        &self,
        pending: &PendingTransaction,
    ) -> StorageResult<()> {
        self.executor_tables()?
            .pending
            .insert((pending.key.clone(), pending.batch_index), pending.clone());
        Ok(())
    }

    async fn delete_pending_execution(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
    ) -> StorageResult<()> {
        self.executor_tables()?
            .pending
            .remove(&(key.clone(), batch_index));
        Ok(())
    }

    async fn archive_pending_execution(
        &self,
        pending: &PendingTransaction,
        reason: ArchiveReason,
    ) -> StorageResult<()> {
        let mut tables = self.executor_tables()?;
        let pending_key = (pending.key.clone(), pending.batch_index);
        tables.pending.remove(&pending_key);
        tables
            .archived
            .insert(pending_key, (pending.clone(), reason));
        Ok(())
    }

    async fn get_pending_executions(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<PendingTransaction>> {
        let tables = self.executor_tables()?;
        Ok(tables
            .pending
            .values()
            .cloned()
            .sorted_by(|a, b| {
                a.next_check_time
                    .cmp(&b.next_check_time)
                    .then_with(|| a.nonce.cmp(&b.nonce))
            })
            .take(limit)
            .collect())
    }

    async fn get_all_executions(&self, limit: usize) -> StorageResult<Vec<PendingTransaction>> {
        let tables = self.executor_tables()?;
        Ok(tables
            .pending
            .values()
            .cloned()
            .sorted_by_key(|p| (p.key.clone(), p.batch_index))
            .take(limit)
            .collect())
    }

    async fn get_broadcaster(
        &self,
        chain_id: ChainId,
        address: H160,
    ) -> StorageResult<Option<Broadcaster>> {
        Ok(self
            .executor_tables()?
            .broadcasters
            .get(&(chain_id, address))
            .cloned())
    }

    async fn create_broadcaster(&self, broadcaster: &Broadcaster) -> StorageResult<()> {
        self.executor_tables()?
            .broadcasters
            .insert((broadcaster.chain_id, broadcaster.address), broadcaster.clone());
        Ok(())
    }

    async fn update_broadcaster(&self, broadcaster: &Broadcaster) -> StorageResult<()> {
        self.create_broadcaster(broadcaster).await
    }

    async fn acquire_broadcaster_lock(
        &self,
        chain_id: ChainId,
        address: H160,
        token: Uuid,
        now: u64,
        stale_after: u64,
    ) -> StorageResult<Option<Broadcaster>> {
        let mut tables = self.executor_tables()?;
        let row = tables
            .broadcasters
            .entry((chain_id, address))
            .or_insert_with(|| Broadcaster {
                chain_id,
                address,
                next_nonce: 0,
                lock: None,
            });
        let lockable = match &row.lock {
            None => true,
            Some(lock) => now.saturating_sub(lock.timestamp) > stale_after,
        };
        if !lockable {
            return Ok(None);
        }
        row.lock = Some(BroadcasterLock {
            token,
            timestamp: now,
        });
        Ok(Some(row.clone()))
    }

    async fn release_broadcaster_lock(
        &self,
        chain_id: ChainId,
        address: H160,
        token: Uuid,
    ) -> StorageResult<()> {
        let mut tables = self.executor_tables()?;
        if let Some(row) = tables.broadcasters.get_mut(&(chain_id, address)) {
            if row.lock.map(|lock| lock.token) == Some(token) {
                row.lock = None;
            }
        }
        Ok(())
    }

    async fn get_chain_configuration(
        &self,
        chain_id: ChainId,
    ) -> StorageResult<Option<ChainConfiguration>> {
        Ok(self
            .executor_tables()?
            .chain_configurations
            .get(&chain_id)
            .cloned())
    }

    async fn update_expected_worst_case_gas_price(
        &self,
        chain_id: ChainId,
        price: U256,
        timestamp: u64,
    ) -> StorageResult<()> {
        let mut tables = self.executor_tables()?;
        let configuration = tables
            .chain_configurations
            .entry(chain_id)
            .or_insert_with(|| ChainConfiguration::empty(chain_id));
        configuration.expected_worst_case_gas_price = Some(price);
        configuration.expected_worst_case_gas_price_update_time = Some(timestamp);
        Ok(())
    }

    async fn update_fees(
        &self,
        chain_id: ChainId,
        fees: &ChainFees,
        timestamp: u64,
    ) -> StorageResult<()> {
        let mut tables = self.executor_tables()?;
        let configuration = tables
            .chain_configurations
            .entry(chain_id)
            .or_insert_with(|| ChainConfiguration::empty(chain_id));
        configuration.fees = Some(fees.clone());
        configuration.fees_update_time = Some(timestamp);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut tables = self.executor_tables()?;
        tables.pending.clear();
        tables.archived.clear();
        tables.broadcasters.clear();
        tables.chain_configurations.clear();
        Ok(())
    }

    async fn setup(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use crate::execution::{ExecutionKind, ExecutionRequest};
    use crate::timing::Timing;

    use super::*;

    fn request(slot: &str, scheduled_time: u64) -> ExecutionRequest {
        ExecutionRequest {
            chain_id: ChainId(1),
            slot: slot.to_string(),
            kind: ExecutionKind::Clear { executions: vec![] },
            timing: Timing::FixedTime { scheduled_time },
            max_fee_per_gas_authorized: U256::from(1_000),
            expiry: None,
            payment_reserve: None,
        }
    }

    fn queued(slot: &str, checkin_time: u64) -> QueuedExecution {
        QueuedExecution::from_request(H160::repeat_byte(1), request(slot, checkin_time), checkin_time)
    }

    #[tokio::test]
    async fn topmost_executions_are_ordered_by_checkin_time() {
        let storage = MemoryStorage::new();
        for (slot, checkin) in [("c", 300), ("a", 100), ("b", 200)] {
            storage
                .create_or_update_queued_execution(&queued(slot, checkin))
                .await
                .unwrap();
        }

        let top = storage.get_queue_topmost_executions(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key.slot, "a");
        assert_eq!(top[1].key.slot, "b");
    }

    #[tokio::test]
    async fn archive_removes_from_live_queue() {
        let storage = MemoryStorage::new();
        let entry = queued("s", 100);
        storage
            .create_or_update_queued_execution(&entry)
            .await
            .unwrap();
        storage
            .archive_execution(&entry, ArchiveReason::Expired)
            .await
            .unwrap();

        assert!(SchedulerStorage::get_queued_execution(&storage, &entry.key)
            .await
            .unwrap()
            .is_none());
        let archived = storage
            .get_account_archived_submissions(ChainId(1), entry.key.account, 10)
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].reason, ArchiveReason::Expired);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let storage = MemoryStorage::new();
        let chain = ChainId(1);
        let address = H160::repeat_byte(9);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let acquired = storage
            .acquire_broadcaster_lock(chain, address, first, 1_000, 60)
            .await
            .unwrap();
        assert!(acquired.is_some());

        let contended = storage
            .acquire_broadcaster_lock(chain, address, second, 1_010, 60)
            .await
            .unwrap();
        assert!(contended.is_none());

        storage
            .release_broadcaster_lock(chain, address, first)
            .await
            .unwrap();
        let after_release = storage
            .acquire_broadcaster_lock(chain, address, second, 1_020, 60)
            .await
            .unwrap();
        assert!(after_release.is_some());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over_and_release_of_old_token_is_a_noop() {
        let storage = MemoryStorage::new();
        let chain = ChainId(1);
        let address = H160::repeat_byte(9);
        let crashed = Uuid::new_v4();
        let takeover = Uuid::new_v4();

        storage
            .acquire_broadcaster_lock(chain, address, crashed, 1_000, 60)
            .await
            .unwrap()
            .unwrap();

        // 61 seconds later the lock is stale and may be taken over.
        let row = storage
            .acquire_broadcaster_lock(chain, address, takeover, 1_061, 60)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.lock.unwrap().token, takeover);

        // The crashed holder's release must not clear the new lock.
        storage
            .release_broadcaster_lock(chain, address, crashed)
            .await
            .unwrap();
        let still_locked = storage
            .acquire_broadcaster_lock(chain, address, Uuid::new_v4(), 1_062, 60)
            .await
            .unwrap();
        assert!(still_locked.is_none());
    }

    #[tokio::test]
    async fn chain_configuration_updates_accumulate() {
        let storage = MemoryStorage::new();
        let chain = ChainId(5);
        storage
            .update_expected_worst_case_gas_price(chain, U256::from(777), 100)
            .await
            .unwrap();
        storage
            .update_fees(
                chain,
                &ChainFees {
                    max_fee_per_gas: U256::from(50),
                    max_priority_fee_per_gas: U256::from(2),
                },
                200,
            )
            .await
            .unwrap();

        let configuration = storage
            .get_chain_configuration(chain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            configuration.expected_worst_case_gas_price,
            Some(U256::from(777))
        );
        assert_eq!(configuration.fees_update_time, Some(200));
        assert!(configuration.fees.is_some());
    }
}
