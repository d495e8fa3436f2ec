//! Time-locked transaction scheduling and broadcasting.
//!
//! Two cooperating halves: the [`Scheduler`] keeps a durable queue of
//! execution requests and resolves their timing conditions (fixed times,
//! randomness rounds, offsets from prior transactions, encrypted payloads)
//! into concrete broadcast decisions; the [`Executor`] owns broadcaster
//! identities and turns those decisions into signed transactions with strict
//! nonce sequencing, fee escalation over a broadcast schedule, void
//! transactions for unusable slots, and payment-account top-ups for fee
//! shortfalls.
//!
//! Chain access and time-lock decryption sit behind the [`ChainProtocol`]
//! and [`Decrypter`] traits; persistence behind [`SchedulerStorage`] and
//! [`ExecutorStorage`]. All clocks are chain clocks.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::panic)]
#![deny(clippy::arithmetic_side_effects)]

pub use chain::{
    BroadcasterSignerData, ChainConfig, ChainId, ChainProtocol, ChainRegistry, ChainSetup,
    DerivationParameters, GasFeeEstimate, PaymentTransaction, SignedTransaction,
    TransactionInclusion, ValidityCheck,
};
pub use decrypter::{Decrypter, DecryptionResult};
pub use error::{IsRetryable, TimeboltError};
pub use execution::{
    ArchiveReason, ExecutionKey, ExecutionKind, ExecutionRequest, QueueItemOutcome,
    QueueProcessingResult, QueuedExecution, ScheduleResponse, TransactionData,
};
pub use executor::{
    BroadcastOptions, BroadcastSchedule, BroadcastsExecution, ExecutionToBroadcast, Executor,
    ExecutorConfig, FeeTier, PendingPassResult,
};
pub use metrics::EngineMetrics;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use storage::{
    ArchivedExecution, ChainConfiguration, ChainFees, ExecutorStorage, SchedulerStorage,
    StorageError, StorageResult,
};
pub use timing::{compute_potential_execution_time, BlockConfirmation, PriorTransaction, Timing};
pub use transaction::{
    Broadcaster, BroadcasterLock, ExecutionResponse, PendingTransaction, TransactionParams,
};

mod chain;
mod decrypter;
mod error;
mod execution;
mod executor;
mod metrics;
mod scheduler;
pub mod storage;
mod timing;
mod transaction;
