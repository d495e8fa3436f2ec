//! First broadcast of an accepted execution. Everything that touches the
//! nonce cursor happens while holding the broadcaster lock, and the lock is
//! released only after the pending record is persisted, so a crash in
//! between is recoverable by re-deriving state from the chain.

use async_trait::async_trait;
use primitive_types::H160;
use tracing::{info, instrument, warn};

use crate::chain::BroadcasterSignerData;
use crate::error::TimeboltError;
use crate::execution::ExecutionKey;
use crate::storage::ChainFees;
use crate::transaction::{Broadcaster, ExecutionResponse, PendingTransaction, TransactionParams};

use super::{BroadcastOptions, BroadcastSchedule, BroadcastsExecution, ExecutionToBroadcast, Executor};

#[async_trait]
impl BroadcastsExecution for Executor {
    #[instrument(
        skip_all,
        name = "Executor::broadcast_execution",
        fields(chain = %execution.chain_id, account = ?account, slot = %slot, batch_index)
    )]
    async fn broadcast_execution(
        &self,
        slot: &str,
        batch_index: u32,
        account: H160,
        execution: ExecutionToBroadcast,
        options: BroadcastOptions,
    ) -> Result<ExecutionResponse, TimeboltError> {
        let key = ExecutionKey::new(execution.chain_id, account, slot.to_string());

        // Dedupe on the key: the scheduler hand-off retries after a crash,
        // and a replay must not consume a second nonce.
        if let Some(existing) = self.storage.get_pending_execution(&key, batch_index).await? {
            info!(?existing, "Execution already broadcast, returning existing response");
            return Ok(ExecutionResponse::from_pending(&existing));
        }
        // Settled transactions leave the live index, so a replay that arrives
        // after finalization is only visible in the archive.
        if let Some(settled) = self
            .storage
            .get_archived_pending_execution(&key, batch_index)
            .await?
        {
            info!(?settled, "Execution already settled, returning archived response");
            return Ok(ExecutionResponse::from_pending(&settled));
        }

        let chain = self.chains.get(&execution.chain_id)?;
        let signer = chain
            .protocol
            .get_broadcaster(&self.config.derivation_parameters, account)
            .await?;

        let (broadcaster_row, guard) = self
            .lock_broadcaster(execution.chain_id, signer.address)
            .await?;
        let result = self
            .broadcast_with_lock(&key, batch_index, &signer, broadcaster_row, &execution, &options)
            .await;
        let unlock = self.unlock_broadcaster(guard).await;
        let response = result?;
        unlock?;
        Ok(response)
    }
}

impl Executor {
    async fn broadcast_with_lock(
        &self,
        key: &ExecutionKey,
        batch_index: u32,
        signer: &BroadcasterSignerData,
        mut broadcaster_row: Broadcaster,
        execution: &ExecutionToBroadcast,
        options: &BroadcastOptions,
    ) -> Result<ExecutionResponse, TimeboltError> {
        let chain = self.chains.get(&key.chain_id)?;
        let protocol = chain.protocol.clone();

        // Reconcile the cursor with the chain. The stored cursor is
        // authoritative going forward only if it is >= the on-chain value;
        // otherwise an out-of-band transaction moved the chain ahead.
        let on_chain_nonce = protocol.get_nonce(signer.address).await?;
        if on_chain_nonce > broadcaster_row.next_nonce {
            warn!(
                stored_nonce = broadcaster_row.next_nonce,
                on_chain_nonce, "Chain is ahead of the stored nonce cursor, correcting upward"
            );
            broadcaster_row.next_nonce = on_chain_nonce;
        }
        let nonce = broadcaster_row.next_nonce;
        let now = protocol.get_timestamp().await?;

        let estimate = protocol
            .get_gas_fee(
                options.max_fee_per_gas_authorized,
                self.config.importance_ratio,
            )
            .await?;
        self.storage
            .update_fees(
                key.chain_id,
                &ChainFees {
                    max_fee_per_gas: estimate.max_fee_per_gas,
                    max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
                },
                now,
            )
            .await?;
        let schedule = match &options.broadcast_schedule {
            Some(schedule) => schedule.clone(),
            None => BroadcastSchedule::for_authorized_fee(
                options.max_fee_per_gas_authorized,
                &estimate,
                self.config.schedule_tier_count,
                self.config.schedule_tier_duration,
            )?,
        };
        let tier0 = schedule.first().clone();
        let initial_fee = tier0
            .max_fee_per_gas
            .min(options.max_fee_per_gas_authorized);
        let params = TransactionParams {
            nonce,
            max_fee_per_gas: initial_fee,
            max_priority_fee_per_gas: tier0.max_priority_fee_per_gas.min(initial_fee),
            from: signer.address,
        };

        // Commitments against the chain's expected worst-case gas price must
        // be covered by the authorization plus the payment reserve.
        let worst_case_underfunded = self
            .storage
            .get_chain_configuration(key.chain_id)
            .await?
            .and_then(|configuration| configuration.expected_worst_case_gas_price)
            .map(|worst_case| {
                let covered = options
                    .max_fee_per_gas_authorized
                    .saturating_add(options.payment_reserve.unwrap_or_default());
                covered < worst_case
            })
            .unwrap_or(false);

        let validity = protocol
            .check_validity(key.chain_id, &execution.transaction, signer, &params)
            .await?;

        // A request that fails validation still consumes its nonce through a
        // void self-transfer, so one bad slot never stalls the sequence.
        let void_reason = if validity.revert {
            Some("transaction would revert")
        } else if validity.not_enough_gas {
            Some("authorized max fee cannot cover the gas cost")
        } else if worst_case_underfunded {
            Some("authorization plus payment reserve below expected worst-case gas price")
        } else {
            None
        };
        let signed = match void_reason {
            Some(reason) => {
                warn!(nonce, reason, "Validation failed, filling the nonce with a void transaction");
                protocol
                    .sign_void_transaction(key.chain_id, signer, &params)
                    .await?
            }
            None => {
                protocol
                    .sign_transaction(key.chain_id, &execution.transaction, signer, &params)
                    .await?
            }
        };

        let hash = protocol.broadcast_signed_transaction(&signed.raw_tx).await?;
        let pending = PendingTransaction {
            key: key.clone(),
            batch_index,
            hash,
            broadcaster: signer.address,
            nonce,
            params,
            transaction: execution.transaction.clone(),
            initial_time: now,
            broadcast_time: now,
            next_check_time: now.saturating_add(tier0.duration),
            is_void_transaction: void_reason.is_some(),
            max_fee_per_gas_authorized: options.max_fee_per_gas_authorized,
            helped_for_up_to_gas_price: None,
            finalized: false,
            retries: 0,
            last_error: void_reason.map(str::to_string),
            expiry_time: options.expiry_time,
            schedule,
        };
        self.storage
            .create_or_update_pending_execution(&pending)
            .await?;
        broadcaster_row.next_nonce = nonce.saturating_add(1);
        self.storage.update_broadcaster(&broadcaster_row).await?;

        let chain_label = key.chain_id.to_string();
        let kind = if pending.is_void_transaction {
            "void"
        } else {
            "real"
        };
        self.metrics.record_broadcast(&chain_label, kind);
        info!(?hash, nonce, kind, "Broadcast execution at first fee tier");
        Ok(ExecutionResponse::from_pending(&pending))
    }
}
