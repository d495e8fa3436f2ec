//! The queue pass: dependency resolution, expiry, decryption and hand-off to
//! the executor, one entry at a time with per-item error isolation.

use tracing::{info, instrument, warn};

use crate::chain::TransactionInclusion;
use crate::decrypter::DecryptionResult;
use crate::error::{IsRetryable, TimeboltError};
use crate::execution::{
    ArchiveReason, ExecutionKind, QueueItemOutcome, QueueProcessingResult, QueuedExecution,
    TransactionData,
};
use crate::executor::{BroadcastOptions, ExecutionToBroadcast};
use crate::timing::BlockConfirmation;

use super::Scheduler;

/// Immediately-decryptable onion layers peeled within one pass before the
/// entry is deferred anyway.
const MAX_DECRYPTION_LAYERS: usize = 32;

enum ResolvedContent {
    Executions(Vec<TransactionData>),
    Requeued { checkin_time: u64 },
    Failed { reason: String },
}

impl Scheduler {
    /// One pass over the queue head. Storage errors abort the pass; any other
    /// per-item error leaves that entry untouched and is reported in the
    /// result.
    #[instrument(skip_all, name = "Scheduler::process_queue")]
    pub async fn process_queue(&self) -> Result<QueueProcessingResult, TimeboltError> {
        let limit = self.config.queue_process_limit;
        let entries = self.storage.get_queue_topmost_executions(limit).await?;
        let mut result = QueueProcessingResult {
            limit,
            items: Vec::with_capacity(entries.len()),
        };
        for entry in entries {
            let key = entry.key.clone();
            let outcome = match self.process_entry(entry).await {
                Ok(outcome) => outcome,
                Err(TimeboltError::Storage(error)) => return Err(error.into()),
                Err(error) => {
                    warn!(%key, %error, "Queue entry failed, leaving it for the next pass");
                    self.metrics
                        .record_item_error(&error.to_metrics_label(), "retry_next_pass");
                    QueueItemOutcome::Errored(error.to_string())
                }
            };
            self.metrics
                .record_queue_item(&key.chain_id.to_string(), outcome_label(&outcome));
            result.items.push((key, outcome));
        }
        Ok(result)
    }

    async fn process_entry(
        &self,
        mut entry: QueuedExecution,
    ) -> Result<QueueItemOutcome, TimeboltError> {
        let chain = self.chains.get(&entry.key.chain_id)?;
        let protocol = chain.protocol.clone();
        let now = protocol.get_timestamp().await?;

        // A set flag means a previous run crashed between hand-off and
        // deletion. Re-run the hand-off; the executor dedupes on the key so
        // no second nonce is consumed.
        if entry.broadcasted {
            info!(key = %entry.key, "Recovering interrupted hand-off");
            return match self.resolve_content(&mut entry, now).await? {
                ResolvedContent::Executions(executions) => {
                    self.hand_off(entry, executions).await
                }
                ResolvedContent::Requeued { checkin_time } => {
                    self.storage
                        .create_or_update_queued_execution(&entry)
                        .await?;
                    Ok(QueueItemOutcome::Deferred { checkin_time })
                }
                ResolvedContent::Failed { reason } => {
                    self.archive(entry, ArchiveReason::DecryptionFailed, &reason)
                        .await
                }
            };
        }

        // Resolve the dependency, if any, before anything time-based: the
        // execution time of a delta timing is only an estimate until the
        // prior transaction's block time is known.
        if let Some(prior) = entry.timing.prior_transaction() {
            if entry.prior_transaction_confirmation.is_none() {
                match protocol.get_transaction_status(&prior.hash).await? {
                    TransactionInclusion::Finalized { failed: true, .. } => {
                        return self
                            .archive(
                                entry,
                                ArchiveReason::DependencyFailed,
                                "prior transaction failed on chain",
                            )
                            .await;
                    }
                    TransactionInclusion::Finalized {
                        block_time,
                        failed: false,
                    } => {
                        entry.prior_transaction_confirmation =
                            Some(BlockConfirmation { block_time });
                        entry.checkin_time = entry.resolved_execution_time();
                        entry.retries = 0;
                    }
                    TransactionInclusion::Pending | TransactionInclusion::NotFound => {
                        entry.retries = entry.retries.saturating_add(1);
                        if entry.retries >= self.config.max_dependency_retries {
                            warn!(
                                key = %entry.key,
                                retries = entry.retries,
                                "Dependency never confirmed, dropping entry"
                            );
                            self.storage.delete_execution(&entry.key).await?;
                            return Ok(QueueItemOutcome::Deleted);
                        }
                        entry.checkin_time =
                            now.saturating_add(chain.config.worst_case_block_time);
                        let checkin_time = entry.checkin_time;
                        self.storage
                            .create_or_update_queued_execution(&entry)
                            .await?;
                        return Ok(QueueItemOutcome::Deferred { checkin_time });
                    }
                }
            }
        }

        // An entry that sat past its expiry window plus the finality margin
        // must never run.
        let finality_margin =
            u64::from(chain.config.finality).saturating_mul(chain.config.worst_case_block_time);
        let deadline = entry
            .resolved_execution_time()
            .saturating_add(self.expiry_window(&entry))
            .saturating_add(finality_margin);
        if now > deadline {
            return self
                .archive(entry, ArchiveReason::Expired, "expiry window elapsed")
                .await;
        }

        if entry.checkin_time > now {
            let checkin_time = entry.checkin_time;
            self.storage
                .create_or_update_queued_execution(&entry)
                .await?;
            return Ok(QueueItemOutcome::Deferred { checkin_time });
        }

        match self.resolve_content(&mut entry, now).await? {
            ResolvedContent::Executions(executions) => self.hand_off(entry, executions).await,
            ResolvedContent::Requeued { checkin_time } => {
                self.storage
                    .create_or_update_queued_execution(&entry)
                    .await?;
                Ok(QueueItemOutcome::Deferred { checkin_time })
            }
            ResolvedContent::Failed { reason } => {
                self.archive(entry, ArchiveReason::DecryptionFailed, &reason)
                    .await
            }
        }
    }

    /// Turn the entry's content into a concrete execution list. Time-locked
    /// payloads are decrypted layer by layer; a layer that is not yet
    /// decryptable requeues the entry at the decrypter's retry time.
    async fn resolve_content(
        &self,
        entry: &mut QueuedExecution,
        now: u64,
    ) -> Result<ResolvedContent, TimeboltError> {
        if let ExecutionKind::Clear { executions } = &entry.kind {
            return Ok(ResolvedContent::Executions(executions.clone()));
        }

        for _ in 0..MAX_DECRYPTION_LAYERS {
            match self.decrypter.decrypt(entry).await? {
                DecryptionResult::Decrypted { payload } => {
                    return match serde_json::from_slice::<Vec<TransactionData>>(&payload) {
                        Ok(executions) => Ok(ResolvedContent::Executions(executions)),
                        Err(error) => Ok(ResolvedContent::Failed {
                            reason: format!("decrypted payload does not decode: {error}"),
                        }),
                    };
                }
                DecryptionResult::RetryLater {
                    payload,
                    timing,
                    retry_time,
                } => {
                    entry.kind = ExecutionKind::TimeLocked { payload };
                    if let Some(timing) = timing {
                        entry.timing = timing;
                    }
                    if retry_time > now {
                        entry.checkin_time = retry_time;
                        return Ok(ResolvedContent::Requeued {
                            checkin_time: retry_time,
                        });
                    }
                    // inner layer already due, keep peeling
                }
                DecryptionResult::PermanentFailure { reason } => {
                    return Ok(ResolvedContent::Failed { reason });
                }
            }
        }
        entry.checkin_time = now.saturating_add(1);
        Ok(ResolvedContent::Requeued {
            checkin_time: entry.checkin_time,
        })
    }

    /// Hand every resolved transaction to the executor, then remove the entry
    /// from the live queue. The broadcasted flag is persisted first so an
    /// interruption is visible to the next pass.
    async fn hand_off(
        &self,
        mut entry: QueuedExecution,
        executions: Vec<TransactionData>,
    ) -> Result<QueueItemOutcome, TimeboltError> {
        entry.broadcasted = true;
        self.storage
            .create_or_update_queued_execution(&entry)
            .await?;

        let expiry_time = entry
            .resolved_execution_time()
            .saturating_add(self.expiry_window(&entry));
        let mut first_response = None;
        for (index, transaction) in executions.iter().enumerate() {
            let response = self
                .executor
                .broadcast_execution(
                    &entry.key.slot,
                    index as u32,
                    entry.key.account,
                    ExecutionToBroadcast {
                        chain_id: entry.key.chain_id,
                        transaction: transaction.clone(),
                    },
                    BroadcastOptions {
                        max_fee_per_gas_authorized: entry.max_fee_per_gas_authorized,
                        payment_reserve: entry.payment_reserve,
                        expiry_time: Some(expiry_time),
                        broadcast_schedule: None,
                    },
                )
                .await?;
            info!(
                key = %entry.key,
                batch_index = response.batch_index,
                nonce = response.nonce,
                hash = ?response.hash,
                is_void = response.is_void_transaction,
                "Handed execution to the executor"
            );
            if first_response.is_none() {
                first_response = Some(response);
            }
        }
        self.storage.delete_execution(&entry.key).await?;

        match first_response {
            Some(response) => Ok(QueueItemOutcome::Broadcasted {
                nonce: response.nonce,
                hash: response.hash,
            }),
            None => {
                info!(key = %entry.key, "Entry resolved to an empty execution list, removing");
                Ok(QueueItemOutcome::Deleted)
            }
        }
    }

    async fn archive(
        &self,
        entry: QueuedExecution,
        reason: ArchiveReason,
        detail: &str,
    ) -> Result<QueueItemOutcome, TimeboltError> {
        warn!(key = %entry.key, ?reason, detail, "Archiving queue entry");
        self.storage.archive_execution(&entry, reason).await?;
        Ok(QueueItemOutcome::Archived(reason))
    }

    /// Requested expiry window, capped by the scheduler's maximum.
    fn expiry_window(&self, entry: &QueuedExecution) -> u64 {
        entry
            .expiry
            .unwrap_or(self.config.max_expiry)
            .min(self.config.max_expiry)
    }
}

fn outcome_label(outcome: &QueueItemOutcome) -> &'static str {
    match outcome {
        QueueItemOutcome::Broadcasted { .. } => "broadcasted",
        QueueItemOutcome::Deferred { .. } => "deferred",
        QueueItemOutcome::Archived(_) => "archived",
        QueueItemOutcome::Deleted => "deleted",
        QueueItemOutcome::Errored(_) => "errored",
    }
}
