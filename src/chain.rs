//! Contract between the engine and the per-chain protocol adapters.
//!
//! The core never implements this trait for a real chain; adapters live in
//! their own crates and are handed in as `Arc<dyn ChainProtocol>`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::TimeboltError;
use crate::execution::TransactionData;
use crate::transaction::TransactionParams;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public derivation parameters of the signing backend. Opaque to the core;
/// forwarded verbatim to `ChainProtocol::get_broadcaster`.
pub type DerivationParameters = serde_json::Value;

/// Outcome of a transaction status query, folded into the engine's view of
/// finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionInclusion {
    /// Not known to the node at all.
    NotFound,
    /// In the mempool or in a block younger than the finality margin.
    Pending,
    /// Included in a block old enough to be considered irreversible.
    Finalized { block_time: u64, failed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasFeeEstimate {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas_price_estimate: U256,
}

/// Deterministically-derived signing identity for a logical account. The
/// `signer` field is an opaque handle the adapter understands; the engine
/// only ever passes it back into the signing calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterSignerData {
    pub signer: String,
    pub address: H160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityCheck {
    /// The transaction would revert if broadcast now.
    pub revert: bool,
    /// The authorized max fee cannot cover the simulated gas cost.
    pub not_enough_gas: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw_tx: Vec<u8>,
    pub hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub transaction: TransactionData,
    pub cost: U256,
}

/// One implementation per supported chain. All calls may block on network
/// I/O; callers treat failures as "unknown, retry next pass".
#[async_trait]
pub trait ChainProtocol: Send + Sync {
    /// Chain time in seconds. All scheduling decisions anchor to this clock,
    /// never to the host's.
    async fn get_timestamp(&self) -> Result<u64, TimeboltError>;

    /// Advance the virtual clock. Only test adapters implement this.
    async fn increase_time(&self, _amount: u64) -> Result<(), TimeboltError> {
        Err(TimeboltError::VirtualClockUnsupported)
    }

    async fn get_transaction_status(
        &self,
        hash: &H256,
    ) -> Result<TransactionInclusion, TimeboltError>;

    /// Current on-chain nonce of `address` (the next nonce the chain would
    /// accept).
    async fn get_nonce(&self, address: H160) -> Result<u64, TimeboltError>;

    async fn get_gas_fee(
        &self,
        max_fee_per_gas_authorized: U256,
        importance_ratio: u32,
    ) -> Result<GasFeeEstimate, TimeboltError>;

    /// Deterministic: the same `for_address` always resolves to the same
    /// broadcaster for a given chain, across process restarts.
    async fn get_broadcaster(
        &self,
        derivation_parameters: &DerivationParameters,
        for_address: H160,
    ) -> Result<BroadcasterSignerData, TimeboltError>;

    async fn check_validity(
        &self,
        chain_id: ChainId,
        tx: &TransactionData,
        broadcaster: &BroadcasterSignerData,
        params: &TransactionParams,
    ) -> Result<ValidityCheck, TimeboltError>;

    async fn sign_transaction(
        &self,
        chain_id: ChainId,
        tx: &TransactionData,
        broadcaster: &BroadcasterSignerData,
        params: &TransactionParams,
    ) -> Result<SignedTransaction, TimeboltError>;

    /// Sign a harmless self-transfer at `params.nonce`, used to consume a
    /// nonce when the intended transaction cannot be sent.
    async fn sign_void_transaction(
        &self,
        chain_id: ChainId,
        broadcaster: &BroadcasterSignerData,
        params: &TransactionParams,
    ) -> Result<SignedTransaction, TimeboltError>;

    async fn broadcast_signed_transaction(&self, raw_tx: &[u8]) -> Result<H256, TimeboltError>;

    /// Build a top-up transfer from the payment account to the broadcaster
    /// covering `diff_to_cover` of a fee shortfall.
    async fn generate_payment_transaction(
        &self,
        tx: &TransactionData,
        max_fee_per_gas: U256,
        from: H160,
        diff_to_cover: U256,
    ) -> Result<PaymentTransaction, TimeboltError>;
}

/// Per-chain settings the engine needs beyond the adapter itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Confirmation depth after which inclusion is treated as irreversible.
    pub finality: u32,
    /// Upper bound on the time between blocks, in seconds.
    pub worst_case_block_time: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            finality: 12,
            worst_case_block_time: 30,
        }
    }
}

#[derive(Clone, new)]
pub struct ChainSetup {
    pub protocol: Arc<dyn ChainProtocol>,
    pub config: ChainConfig,
}

/// The set of chains an engine instance serves.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<ChainId, ChainSetup>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain_id: ChainId, setup: ChainSetup) -> Self {
        self.chains.insert(chain_id, setup);
        self
    }

    pub fn get(&self, chain_id: &ChainId) -> Result<&ChainSetup, TimeboltError> {
        self.chains
            .get(chain_id)
            .ok_or(TimeboltError::ChainNotConfigured(*chain_id))
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.chains.contains_key(chain_id)
    }
}
