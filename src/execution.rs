//! Scheduled execution records: what clients submit and what the queue
//! stores.

use std::fmt::{self, Debug};

use chrono::{DateTime, Utc};
use derive_new::new;
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

use crate::chain::ChainId;
use crate::timing::{compute_potential_execution_time, BlockConfirmation, Timing};

/// Key of a scheduled execution. `slot` is caller-chosen and lets an account
/// run several independent requests, or replace one deterministically by
/// reusing the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, new)]
pub struct ExecutionKey {
    pub chain_id: ChainId,
    pub account: H160,
    pub slot: String,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}/{}", self.chain_id, self.account, self.slot)
    }
}

/// Chain-agnostic transaction parameters as supplied by the client (or
/// revealed by decryption).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionData {
    pub to: H160,
    #[serde(default, with = "serde_bytes_hex")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub value: U256,
    pub gas: U256,
}

/// Hex (de)serialization for calldata, so decrypted JSON payloads stay
/// human-auditable.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(bytes.len().saturating_mul(2).saturating_add(2));
        out.push_str("0x");
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        serializer.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let stripped = text.strip_prefix("0x").unwrap_or(&text);
        if stripped.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        (0..stripped.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&stripped[i..i.saturating_add(2)], 16)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Execution content: either transactions in the clear, or an encrypted
/// payload that only decrypts at the target time/round.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionKind {
    Clear { executions: Vec<TransactionData> },
    TimeLocked { payload: Vec<u8> },
}

impl Debug for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Clear { executions } => f
                .debug_struct("Clear")
                .field("executions", &executions.len())
                .finish(),
            ExecutionKind::TimeLocked { payload } => f
                .debug_struct("TimeLocked")
                .field("payload_len", &payload.len())
                .finish(),
        }
    }
}

/// A client request to schedule one execution. The signed wire body of the
/// public API deserializes into this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub chain_id: ChainId,
    pub slot: String,
    pub kind: ExecutionKind,
    pub timing: Timing,
    pub max_fee_per_gas_authorized: U256,
    /// Seconds past the resolved execution time after which the request must
    /// not run; capped by the scheduler's `max_expiry`.
    #[serde(default)]
    pub expiry: Option<u64>,
    /// Funds earmarked against the account's outstanding commitments.
    #[serde(default)]
    pub payment_reserve: Option<U256>,
}

/// One live entry of the scheduler queue.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedExecution {
    pub key: ExecutionKey,
    pub kind: ExecutionKind,
    pub timing: Timing,
    /// Next wall-clock instant the scheduler must re-evaluate this entry.
    pub checkin_time: u64,
    pub broadcasted: bool,
    pub finalized: bool,
    /// Unresolved-dependency re-checks so far; bounded by configuration.
    pub retries: u32,
    pub prior_transaction_confirmation: Option<BlockConfirmation>,
    pub payment_reserve: Option<U256>,
    pub expected_worst_case_gas_price: Option<U256>,
    pub max_fee_per_gas_authorized: U256,
    pub expiry: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Debug for QueuedExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedExecution")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("timing", &self.timing)
            .field("checkin_time", &self.checkin_time)
            .field("retries", &self.retries)
            .field("broadcasted", &self.broadcasted)
            .finish()
    }
}

impl QueuedExecution {
    pub fn from_request(account: H160, request: ExecutionRequest, checkin_time: u64) -> Self {
        Self {
            key: ExecutionKey::new(request.chain_id, account, request.slot),
            kind: request.kind,
            timing: request.timing,
            checkin_time,
            broadcasted: false,
            finalized: false,
            retries: 0,
            prior_transaction_confirmation: None,
            payment_reserve: request.payment_reserve,
            expected_worst_case_gas_price: None,
            max_fee_per_gas_authorized: request.max_fee_per_gas_authorized,
            expiry: request.expiry,
            created_at: Utc::now(),
        }
    }

    /// Structural equality against a fresh request, used for replay-safe
    /// idempotent admission. Lifecycle fields (checkin, retries,
    /// confirmation cache) deliberately do not participate.
    pub fn matches_request(&self, account: H160, request: &ExecutionRequest) -> bool {
        self.key.chain_id == request.chain_id
            && self.key.account == account
            && self.key.slot == request.slot
            && self.kind == request.kind
            && self.timing == request.timing
            && self.max_fee_per_gas_authorized == request.max_fee_per_gas_authorized
            && self.expiry == request.expiry
            && self.payment_reserve == request.payment_reserve
    }

    /// Re-resolve `checkin_time` from the timing descriptor and the cached
    /// confirmation.
    pub fn resolved_execution_time(&self) -> u64 {
        compute_potential_execution_time(&self.timing, self.prior_transaction_confirmation.as_ref())
    }
}

/// Why an entry left the live queue for the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveReason {
    /// Time budget exceeded before the entry became executable.
    Expired,
    /// The prerequisite transaction reverted; the entry must never run.
    DependencyFailed,
    /// The decrypter reported no retry path.
    DecryptionFailed,
    /// Broadcast confirmed and succeeded.
    Finalized,
    /// Broadcast confirmed but the transaction failed on chain.
    FinalizedFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub checkin_time: u64,
}

/// Per-item outcome of one `process_queue` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItemOutcome {
    /// Handed to the executor and removed from the live queue.
    Broadcasted { nonce: u64, hash: H256 },
    /// Not due yet, or pushed forward; stays queued.
    Deferred { checkin_time: u64 },
    Archived(ArchiveReason),
    /// Removed without archival: dependency retry cap reached, or nothing
    /// left to broadcast.
    Deleted,
    /// Transient per-item failure; entry left unchanged for the next pass.
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueProcessingResult {
    pub limit: usize,
    pub items: Vec<(ExecutionKey, QueueItemOutcome)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_data_round_trips_through_json_with_hex_calldata() {
        let tx = TransactionData {
            to: H160::repeat_byte(0x11),
            data: vec![0xde, 0xad, 0xbe, 0xef],
            value: U256::from(5),
            gas: U256::from(21_000),
        };
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("0xdeadbeef"));
        let back: TransactionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn matches_request_ignores_lifecycle_fields() {
        let account = H160::repeat_byte(0x22);
        let request = ExecutionRequest {
            chain_id: ChainId(1),
            slot: "slot-0".to_string(),
            kind: ExecutionKind::Clear { executions: vec![] },
            timing: Timing::FixedTime {
                scheduled_time: 100,
            },
            max_fee_per_gas_authorized: U256::from(1_000),
            expiry: None,
            payment_reserve: None,
        };
        let mut queued = QueuedExecution::from_request(account, request.clone(), 100);
        queued.retries = 5;
        queued.checkin_time = 400;
        assert!(queued.matches_request(account, &request));

        let mut different = request;
        different.max_fee_per_gas_authorized = U256::from(2_000);
        assert!(!queued.matches_request(account, &different));
    }
}
