//! Durable scheduling queue: admits signed execution requests, resolves
//! their timing conditions pass by pass, and hands due entries to the
//! executor.

use std::sync::Arc;

use primitive_types::H160;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::chain::{ChainId, ChainRegistry};
use crate::decrypter::Decrypter;
use crate::error::TimeboltError;
use crate::execution::{ExecutionKey, ExecutionRequest, QueuedExecution, ScheduleResponse};
use crate::executor::BroadcastsExecution;
use crate::metrics::EngineMetrics;
use crate::storage::{ArchivedExecution, SchedulerStorage};
use crate::timing::compute_potential_execution_time;

mod process;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound of queue entries examined per pass.
    pub queue_process_limit: usize,
    /// Hard cap on any request's expiry window, in seconds past the resolved
    /// execution time.
    pub max_expiry: u64,
    /// Unresolved-dependency re-checks before an entry is dropped.
    pub max_dependency_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_process_limit: 25,
            max_expiry: 86_400,
            max_dependency_retries: 10,
        }
    }
}

pub struct Scheduler {
    pub(crate) storage: Arc<dyn SchedulerStorage>,
    pub(crate) decrypter: Arc<dyn Decrypter>,
    pub(crate) executor: Arc<dyn BroadcastsExecution>,
    pub(crate) chains: ChainRegistry,
    pub(crate) config: SchedulerConfig,
    pub(crate) metrics: EngineMetrics,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn SchedulerStorage>,
        decrypter: Arc<dyn Decrypter>,
        executor: Arc<dyn BroadcastsExecution>,
        chains: ChainRegistry,
        config: SchedulerConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            storage,
            decrypter,
            executor,
            chains,
            config,
            metrics,
        }
    }

    /// Admit a request into the queue. Idempotent: re-submitting a request
    /// identical to the stored one returns the stored check-in time, while a
    /// different request under an occupied slot is refused.
    #[instrument(
        skip_all,
        name = "Scheduler::submit_execution",
        fields(account = ?account, chain = %request.chain_id, slot = %request.slot)
    )]
    pub async fn submit_execution(
        &self,
        account: H160,
        request: ExecutionRequest,
    ) -> Result<ScheduleResponse, TimeboltError> {
        if !self.chains.contains(&request.chain_id) {
            return Err(TimeboltError::ChainNotConfigured(request.chain_id));
        }
        let key = ExecutionKey::new(request.chain_id, account, request.slot.clone());
        if let Some(existing) = self.storage.get_queued_execution(&key).await? {
            if existing.matches_request(account, &request) {
                info!(
                    checkin_time = existing.checkin_time,
                    "Replayed submission, returning stored check-in"
                );
                return Ok(ScheduleResponse {
                    checkin_time: existing.checkin_time,
                });
            }
            return Err(TimeboltError::SlotAlreadyUsed {
                account,
                slot: request.slot,
            });
        }

        let checkin_time = compute_potential_execution_time(&request.timing, None);
        let queued = QueuedExecution::from_request(account, request, checkin_time);
        self.storage
            .create_or_update_queued_execution(&queued)
            .await?;
        info!(checkin_time, "Execution scheduled");
        Ok(ScheduleResponse { checkin_time })
    }

    pub async fn get_execution_status(
        &self,
        key: &ExecutionKey,
    ) -> Result<Option<QueuedExecution>, TimeboltError> {
        Ok(self.storage.get_queued_execution(key).await?)
    }

    pub async fn list_account_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> Result<Vec<QueuedExecution>, TimeboltError> {
        Ok(self
            .storage
            .get_account_submissions(chain_id, account, limit)
            .await?)
    }

    pub async fn list_account_archived_submissions(
        &self,
        chain_id: ChainId,
        account: H160,
        limit: usize,
    ) -> Result<Vec<ArchivedExecution>, TimeboltError> {
        Ok(self
            .storage
            .get_account_archived_submissions(chain_id, account, limit)
            .await?)
    }

    /// Entries stuck between hand-off and deletion; non-empty only right
    /// after a crash.
    pub async fn unfinalized_broadcasted(
        &self,
        limit: usize,
    ) -> Result<Vec<QueuedExecution>, TimeboltError> {
        Ok(self
            .storage
            .get_unfinalized_broadcasted_executions(limit)
            .await?)
    }
}
