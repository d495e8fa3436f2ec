//! Broadcaster-coordination engine: nonce sequencing under an explicit
//! per-broadcaster lock, fee escalation per a broadcast schedule, pending
//! re-checks, void-transaction nonce filling and payment-shortfall help.

use std::sync::Arc;

use async_trait::async_trait;
use primitive_types::{H160, U256};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainId, ChainRegistry, DerivationParameters};
use crate::error::TimeboltError;
use crate::execution::TransactionData;
use crate::metrics::EngineMetrics;
use crate::storage::ExecutorStorage;
use crate::transaction::ExecutionResponse;

mod broadcast;
mod lock;
mod pending;
mod schedule;

pub use pending::PendingPassResult;
pub use schedule::{BroadcastSchedule, FeeTier};

/// One transaction the scheduler resolved and wants on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionToBroadcast {
    pub chain_id: ChainId,
    pub transaction: TransactionData,
}

/// Caller-supplied broadcast parameters. `broadcast_schedule` overrides the
/// derived default; tests and fee-sensitive callers use it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastOptions {
    pub max_fee_per_gas_authorized: U256,
    pub payment_reserve: Option<U256>,
    /// Absolute instant past which no further fee bumps happen.
    pub expiry_time: Option<u64>,
    pub broadcast_schedule: Option<BroadcastSchedule>,
}

/// The seam the scheduler hands executions across. Kept as a trait so the
/// scheduler can be exercised against a mock executor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BroadcastsExecution: Send + Sync {
    async fn broadcast_execution(
        &self,
        slot: &str,
        batch_index: u32,
        account: H160,
        execution: ExecutionToBroadcast,
        options: BroadcastOptions,
    ) -> Result<ExecutionResponse, TimeboltError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Public derivation parameters of the signing backend, forwarded to
    /// `ChainProtocol::get_broadcaster`.
    pub derivation_parameters: DerivationParameters,
    /// Account that covers fee shortfalls of underfunded executions; no
    /// top-ups happen when unset.
    pub payment_account: Option<H160>,
    /// Seconds after which a held broadcaster lock is considered abandoned
    /// and may be taken over.
    pub lock_stale_timeout: u64,
    /// Wait for a contended lock (bounded attempts) instead of failing fast.
    pub wait_for_lock: bool,
    pub lock_attempts: u32,
    pub lock_retry_delay_ms: u64,
    /// Upper bound of pending transactions examined per pass.
    pub pending_process_limit: usize,
    /// Importance hint forwarded to fee estimation.
    pub importance_ratio: u32,
    /// Shape of the derived default broadcast schedule.
    pub schedule_tier_count: u32,
    pub schedule_tier_duration: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            derivation_parameters: DerivationParameters::Null,
            payment_account: None,
            lock_stale_timeout: 60,
            wait_for_lock: true,
            lock_attempts: 3,
            lock_retry_delay_ms: 1_000,
            pending_process_limit: 25,
            importance_ratio: 1,
            schedule_tier_count: 3,
            schedule_tier_duration: 60,
        }
    }
}

pub struct Executor {
    pub(crate) storage: Arc<dyn ExecutorStorage>,
    pub(crate) chains: ChainRegistry,
    pub(crate) config: ExecutorConfig,
    pub(crate) metrics: EngineMetrics,
}

impl Executor {
    pub fn new(
        storage: Arc<dyn ExecutorStorage>,
        chains: ChainRegistry,
        config: ExecutorConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            storage,
            chains,
            config,
            metrics,
        }
    }

    /// All in-flight executions, for operator tooling.
    pub async fn list_executions(
        &self,
        limit: usize,
    ) -> Result<Vec<crate::transaction::PendingTransaction>, TimeboltError> {
        Ok(self.storage.get_all_executions(limit).await?)
    }

    /// In-flight executions of one broadcaster, ordered by nonce.
    pub async fn list_broadcaster_executions(
        &self,
        chain_id: ChainId,
        address: H160,
    ) -> Result<Vec<crate::transaction::PendingTransaction>, TimeboltError> {
        Ok(self
            .storage
            .get_pending_executions_per_broadcaster(chain_id, address)
            .await?)
    }
}
