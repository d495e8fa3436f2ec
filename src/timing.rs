//! Timing descriptors and the pure execution-time resolution function.

use primitive_types::H256;
use serde::{Deserialize, Serialize};

/// A transaction some scheduled execution depends on, identified at
/// submission time before it is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorTransaction {
    pub hash: H256,
    pub nonce: u64,
    /// When the prior transaction was first broadcast; used as the execution
    /// time estimate until the confirmation arrives.
    pub broadcast_time: u64,
}

/// Cached confirmation of a prior transaction, stored on the queued entry
/// once the dependency finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfirmation {
    pub block_time: u64,
}

/// When a scheduled execution becomes due. Exactly one variant is populated;
/// validation happens at the system boundary, not throughout internal logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Timing {
    /// Absolute wall-clock instant.
    FixedTime { scheduled_time: u64 },
    /// External randomness round with its expected reveal time; used for
    /// time-locked payloads.
    FixedRound { round: u64, expected_time: u64 },
    /// Offset from the confirmation of a prior transaction.
    DeltaTime {
        prior_transaction: PriorTransaction,
        delta: u64,
    },
    /// Like `DeltaTime`, unless the target time is later.
    DeltaTimeWithTargetTime {
        prior_transaction: PriorTransaction,
        delta: u64,
        target_time: u64,
    },
}

impl Timing {
    /// The dependency transaction, if this timing has one.
    pub fn prior_transaction(&self) -> Option<&PriorTransaction> {
        match self {
            Timing::FixedTime { .. } | Timing::FixedRound { .. } => None,
            Timing::DeltaTime {
                prior_transaction, ..
            }
            | Timing::DeltaTimeWithTargetTime {
                prior_transaction, ..
            } => Some(prior_transaction),
        }
    }
}

/// Resolve the earliest instant an execution may run. Pure function of the
/// timing descriptor and the (possibly absent) dependency confirmation: for
/// delta timings the prior transaction's broadcast time stands in for the
/// block time until the confirmation is cached.
pub fn compute_potential_execution_time(
    timing: &Timing,
    confirmation: Option<&BlockConfirmation>,
) -> u64 {
    match timing {
        Timing::FixedTime { scheduled_time } => *scheduled_time,
        Timing::FixedRound { expected_time, .. } => *expected_time,
        Timing::DeltaTime {
            prior_transaction,
            delta,
        } => anchor_time(prior_transaction, confirmation).saturating_add(*delta),
        Timing::DeltaTimeWithTargetTime {
            prior_transaction,
            delta,
            target_time,
        } => anchor_time(prior_transaction, confirmation)
            .saturating_add(*delta)
            .max(*target_time),
    }
}

fn anchor_time(prior: &PriorTransaction, confirmation: Option<&BlockConfirmation>) -> u64 {
    confirmation
        .map(|c| c.block_time)
        .unwrap_or(prior.broadcast_time)
}
