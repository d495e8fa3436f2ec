//! Broadcast-side records: broadcaster cursors and in-flight pending
//! transactions.

use std::fmt::{self, Debug};

use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::ChainId;
use crate::execution::{ExecutionKey, TransactionData};
use crate::executor::BroadcastSchedule;

/// Parameters a transaction was (or will be) signed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParams {
    pub nonce: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub from: H160,
}

/// Lock token guarding a broadcaster's nonce cursor. Stored alongside the
/// cursor so acquisition is a conditional write in the shared store, correct
/// across multiple worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterLock {
    pub token: Uuid,
    pub timestamp: u64,
}

/// Deterministically-derived signing identity for (chain, logical account).
/// `next_nonce` only increases, and only while the lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcaster {
    pub chain_id: ChainId,
    pub address: H160,
    pub next_nonce: u64,
    pub lock: Option<BroadcasterLock>,
}

/// One broadcast attempt awaiting finality. Mutated on every re-check (new
/// fee tier, new hash on re-broadcast), deleted or archived once finalized,
/// expired, or superseded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub key: ExecutionKey,
    pub batch_index: u32,
    pub hash: H256,
    pub broadcaster: H160,
    pub nonce: u64,
    pub params: TransactionParams,
    pub transaction: TransactionData,
    /// First broadcast attempt; fee tiers are measured from here.
    pub initial_time: u64,
    /// Most recent (re-)broadcast.
    pub broadcast_time: u64,
    /// Drives the re-check index of the pending store.
    pub next_check_time: u64,
    pub is_void_transaction: bool,
    pub max_fee_per_gas_authorized: U256,
    /// How much of a fee shortfall the payment account has covered so far,
    /// expressed as the gas price reached with its help.
    pub helped_for_up_to_gas_price: Option<U256>,
    pub finalized: bool,
    pub retries: u32,
    pub last_error: Option<String>,
    pub expiry_time: Option<u64>,
    pub schedule: BroadcastSchedule,
}

impl Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .field("nonce", &self.nonce)
            .field("broadcaster", &self.broadcaster)
            .field("next_check_time", &self.next_check_time)
            .field("is_void_transaction", &self.is_void_transaction)
            .field("retries", &self.retries)
            .finish()
    }
}

/// What `broadcast_execution` hands back to the scheduler (and ultimately to
/// the client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub key: ExecutionKey,
    pub batch_index: u32,
    pub broadcaster: H160,
    pub nonce: u64,
    pub hash: H256,
    pub is_void_transaction: bool,
}

impl ExecutionResponse {
    pub fn from_pending(pending: &PendingTransaction) -> Self {
        Self {
            key: pending.key.clone(),
            batch_index: pending.batch_index,
            broadcaster: pending.broadcaster,
            nonce: pending.nonce,
            hash: pending.hash,
            is_void_transaction: pending.is_void_transaction,
        }
    }
}
