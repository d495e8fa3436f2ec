//! Re-check pass over in-flight transactions: finality detection, fee-tier
//! escalation at the same nonce, and payment-account top-ups when a tier
//! exceeds what the submitter authorized.

use futures_util::future::join_all;
use itertools::Itertools;
use primitive_types::{H160, H256, U256};
use tracing::{info, instrument, warn};

use crate::chain::{ChainId, TransactionInclusion};
use crate::error::{IsRetryable, TimeboltError};
use crate::execution::{ArchiveReason, TransactionData};
use crate::transaction::{Broadcaster, PendingTransaction, TransactionParams};

use super::{Executor, FeeTier};

/// Counters of one `process_pending_transactions` pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingPassResult {
    pub checked: usize,
    pub finalized: usize,
    pub escalated: usize,
    pub waiting: usize,
    pub not_due: usize,
    pub errors: usize,
}

impl PendingPassResult {
    fn absorb(&mut self, other: PendingPassResult) {
        self.checked = self.checked.saturating_add(other.checked);
        self.finalized = self.finalized.saturating_add(other.finalized);
        self.escalated = self.escalated.saturating_add(other.escalated);
        self.waiting = self.waiting.saturating_add(other.waiting);
        self.not_due = self.not_due.saturating_add(other.not_due);
        self.errors = self.errors.saturating_add(other.errors);
    }
}

enum CheckOutcome {
    Finalized,
    FinalizedFailed,
    Escalated,
    Waiting,
    NotDue,
}

impl CheckOutcome {
    fn label(&self) -> &'static str {
        match self {
            CheckOutcome::Finalized => "finalized",
            CheckOutcome::FinalizedFailed => "finalized_failed",
            CheckOutcome::Escalated => "escalated",
            CheckOutcome::Waiting => "waiting",
            CheckOutcome::NotDue => "not_due",
        }
    }
}

impl Executor {
    /// Examine up to `pending_process_limit` pending transactions, ordered by
    /// next-check time. Broadcaster groups run concurrently, items within a
    /// group sequentially under that broadcaster's lock. Storage errors abort
    /// the pass; chain errors are confined to their item.
    #[instrument(skip_all, name = "Executor::process_pending_transactions")]
    pub async fn process_pending_transactions(&self) -> Result<PendingPassResult, TimeboltError> {
        let pending = self
            .storage
            .get_pending_executions(self.config.pending_process_limit)
            .await?;
        let groups: Vec<((ChainId, H160), Vec<PendingTransaction>)> = pending
            .into_iter()
            .map(|item| ((item.key.chain_id, item.broadcaster), item))
            .into_group_map()
            .into_iter()
            .collect();

        let group_futures = groups
            .into_iter()
            .map(|((chain_id, broadcaster), items)| {
                self.process_broadcaster_group(chain_id, broadcaster, items)
            });
        let mut result = PendingPassResult::default();
        for group_result in join_all(group_futures).await {
            result.absorb(group_result?);
        }
        info!(?result, "Pending pass finished");
        Ok(result)
    }

    async fn process_broadcaster_group(
        &self,
        chain_id: ChainId,
        broadcaster: H160,
        items: Vec<PendingTransaction>,
    ) -> Result<PendingPassResult, TimeboltError> {
        let mut result = PendingPassResult::default();
        let (_, guard) = match self.lock_broadcaster(chain_id, broadcaster).await {
            Ok(locked) => locked,
            Err(TimeboltError::Storage(error)) => return Err(error.into()),
            Err(error) => {
                warn!(%chain_id, ?broadcaster, %error, "Skipping broadcaster group this pass");
                self.metrics
                    .record_item_error(&error.to_metrics_label(), "skip_group");
                result.errors = result.errors.saturating_add(items.len());
                return Ok(result);
            }
        };

        let chain_label = chain_id.to_string();
        let mut pass_error = None;
        for item in items {
            let key = item.key.clone();
            match self.check_pending_transaction(item).await {
                Ok(outcome) => {
                    self.metrics.record_pending_check(&chain_label, outcome.label());
                    match outcome {
                        CheckOutcome::Finalized | CheckOutcome::FinalizedFailed => {
                            result.finalized = result.finalized.saturating_add(1);
                        }
                        CheckOutcome::Escalated => {
                            result.escalated = result.escalated.saturating_add(1);
                        }
                        CheckOutcome::Waiting => {
                            result.waiting = result.waiting.saturating_add(1);
                        }
                        CheckOutcome::NotDue => {
                            result.not_due = result.not_due.saturating_add(1);
                            continue;
                        }
                    }
                    result.checked = result.checked.saturating_add(1);
                }
                Err(TimeboltError::Storage(error)) => {
                    pass_error = Some(TimeboltError::from(error));
                    break;
                }
                Err(error) => {
                    warn!(%key, %error, "Pending check failed, leaving item for the next pass");
                    self.metrics
                        .record_item_error(&error.to_metrics_label(), "retry_next_pass");
                    result.errors = result.errors.saturating_add(1);
                }
            }
        }

        let unlock = self.unlock_broadcaster(guard).await;
        if let Some(error) = pass_error {
            return Err(error);
        }
        unlock?;
        Ok(result)
    }

    async fn check_pending_transaction(
        &self,
        mut pending: PendingTransaction,
    ) -> Result<CheckOutcome, TimeboltError> {
        let chain = self.chains.get(&pending.key.chain_id)?;
        let protocol = chain.protocol.clone();
        let now = protocol.get_timestamp().await?;
        if pending.next_check_time > now {
            return Ok(CheckOutcome::NotDue);
        }

        match protocol.get_transaction_status(&pending.hash).await? {
            TransactionInclusion::Finalized { failed, .. } => {
                pending.finalized = true;
                let reason = if failed {
                    ArchiveReason::FinalizedFailed
                } else {
                    ArchiveReason::Finalized
                };
                self.storage
                    .archive_pending_execution(&pending, reason)
                    .await?;
                info!(key = %pending.key, hash = ?pending.hash, failed, "Pending transaction finalized");
                Ok(if failed {
                    CheckOutcome::FinalizedFailed
                } else {
                    CheckOutcome::Finalized
                })
            }
            TransactionInclusion::Pending | TransactionInclusion::NotFound => {
                let elapsed = now.saturating_sub(pending.initial_time);
                let past_expiry = pending.expiry_time.map(|e| now > e).unwrap_or(false);
                let escalated = if past_expiry {
                    // Past expiry we stop bumping fees but keep watching for
                    // inclusion of what is already out there.
                    false
                } else {
                    let tier = pending.schedule.tier_at(elapsed).1.clone();
                    if tier.max_fee_per_gas > pending.params.max_fee_per_gas {
                        self.escalate_fee(&mut pending, &tier, now).await?
                    } else {
                        false
                    }
                };
                pending.retries = pending.retries.saturating_add(1);
                pending.next_check_time =
                    now.saturating_add(pending.schedule.next_check_delay(elapsed));
                self.storage
                    .create_or_update_pending_execution(&pending)
                    .await?;
                Ok(if escalated {
                    CheckOutcome::Escalated
                } else {
                    CheckOutcome::Waiting
                })
            }
        }
    }

    /// Re-sign and re-broadcast at the tier's fee, same nonce. Returns false
    /// when the authorization (even with payment help) caps the fee at or
    /// below the current one.
    async fn escalate_fee(
        &self,
        pending: &mut PendingTransaction,
        tier: &FeeTier,
        now: u64,
    ) -> Result<bool, TimeboltError> {
        let chain_id = pending.key.chain_id;
        let chain = self.chains.get(&chain_id)?;
        let protocol = chain.protocol.clone();

        let effective_authorization = pending
            .max_fee_per_gas_authorized
            .max(pending.helped_for_up_to_gas_price.unwrap_or_default());
        let mut target_fee = tier.max_fee_per_gas;
        if target_fee > effective_authorization {
            match self.config.payment_account {
                // The payment account cannot help its own executions: the
                // lock the transfer would need is the one this group holds.
                Some(payment_account) if payment_account != pending.key.account => {
                    self.cover_fee_shortfall(
                        pending,
                        payment_account,
                        target_fee,
                        effective_authorization,
                    )
                    .await?;
                    pending.helped_for_up_to_gas_price = Some(target_fee);
                    // The transfer is on chain at this point; the marker must
                    // be durable even if the re-broadcast below errors.
                    self.storage
                        .create_or_update_pending_execution(pending)
                        .await?;
                }
                _ => target_fee = effective_authorization,
            }
        }
        if target_fee <= pending.params.max_fee_per_gas {
            return Ok(false);
        }

        let signer = protocol
            .get_broadcaster(&self.config.derivation_parameters, pending.key.account)
            .await?;
        pending.params.max_fee_per_gas = target_fee;
        pending.params.max_priority_fee_per_gas = tier.max_priority_fee_per_gas.min(target_fee);
        let signed = if pending.is_void_transaction {
            protocol
                .sign_void_transaction(chain_id, &signer, &pending.params)
                .await?
        } else {
            protocol
                .sign_transaction(chain_id, &pending.transaction, &signer, &pending.params)
                .await?
        };
        pending.hash = protocol.broadcast_signed_transaction(&signed.raw_tx).await?;
        pending.broadcast_time = now;

        self.metrics.record_fee_escalation(&chain_id.to_string());
        info!(
            key = %pending.key,
            nonce = pending.nonce,
            hash = ?pending.hash,
            max_fee_per_gas = ?target_fee,
            "Re-broadcast at higher fee tier"
        );
        Ok(true)
    }

    /// Transfer the fee shortfall from the payment account to the
    /// broadcaster. The transfer goes through the payment account's own
    /// cursor and lock; it is broadcast at the current estimate and not
    /// fee-managed afterwards.
    async fn cover_fee_shortfall(
        &self,
        pending: &PendingTransaction,
        payment_account: H160,
        target_fee: U256,
        covered_up_to: U256,
    ) -> Result<(), TimeboltError> {
        let chain_id = pending.key.chain_id;
        let chain = self.chains.get(&chain_id)?;
        let protocol = chain.protocol.clone();

        let per_gas_shortfall = target_fee.saturating_sub(covered_up_to);
        let diff_to_cover = per_gas_shortfall.saturating_mul(pending.transaction.gas);
        let payment = protocol
            .generate_payment_transaction(
                &pending.transaction,
                target_fee,
                payment_account,
                diff_to_cover,
            )
            .await?;
        let payment_signer = protocol
            .get_broadcaster(&self.config.derivation_parameters, payment_account)
            .await?;

        let (row, guard) = self
            .lock_broadcaster(chain_id, payment_signer.address)
            .await?;
        let submitted = self
            .submit_with_cursor(chain_id, &payment_signer, row, &payment.transaction, target_fee)
            .await;
        let unlock = self.unlock_broadcaster(guard).await;
        let hash = submitted?;
        unlock?;

        let chain_label = chain_id.to_string();
        self.metrics.record_payment_top_up(&chain_label);
        self.metrics.record_broadcast(&chain_label, "payment");
        info!(
            key = %pending.key,
            ?hash,
            cost = ?payment.cost,
            ?diff_to_cover,
            "Covered fee shortfall from the payment account"
        );
        Ok(())
    }

    /// Sign and broadcast `tx` at the row's cursor, then advance it. Caller
    /// holds the broadcaster lock.
    async fn submit_with_cursor(
        &self,
        chain_id: ChainId,
        signer: &crate::chain::BroadcasterSignerData,
        mut row: Broadcaster,
        tx: &TransactionData,
        max_fee_per_gas_authorized: U256,
    ) -> Result<H256, TimeboltError> {
        let chain = self.chains.get(&chain_id)?;
        let protocol = chain.protocol.clone();

        let on_chain_nonce = protocol.get_nonce(signer.address).await?;
        if on_chain_nonce > row.next_nonce {
            row.next_nonce = on_chain_nonce;
        }
        let estimate = protocol
            .get_gas_fee(max_fee_per_gas_authorized, self.config.importance_ratio)
            .await?;
        let params = TransactionParams {
            nonce: row.next_nonce,
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate
                .max_priority_fee_per_gas
                .min(estimate.max_fee_per_gas),
            from: signer.address,
        };
        let signed = protocol.sign_transaction(chain_id, tx, signer, &params).await?;
        let hash = protocol.broadcast_signed_transaction(&signed.raw_tx).await?;
        row.next_nonce = row.next_nonce.saturating_add(1);
        self.storage.update_broadcaster(&row).await?;
        Ok(hash)
    }
}
