use primitive_types::H160;

use crate::chain::ChainId;
use crate::storage::StorageError;

/// Crate-wide error type. Per-item processing errors are captured in pass
/// results; only storage and configuration errors abort a whole pass.
#[derive(Debug, thiserror::Error)]
pub enum TimeboltError {
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("transaction submission error: {0}")]
    TxSubmissionError(String),
    #[error("chain {0} is not configured")]
    ChainNotConfigured(ChainId),
    #[error("slot {slot:?} already holds a different request for account {account:?}")]
    SlotAlreadyUsed { account: H160, slot: String },
    #[error("broadcaster {0:?} is locked by another operation")]
    LockContention(H160),
    #[error("decryption failed: {0}")]
    DecryptionError(String),
    #[error("decrypted payload is not a valid execution list: {0}")]
    PayloadDecodeError(String),
    #[error("broadcast schedule must contain at least one fee tier")]
    EmptyBroadcastSchedule,
    #[error("virtual clock is not supported by this chain protocol")]
    VirtualClockUnsupported,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    EyreError(#[from] eyre::Report),
}

pub trait IsRetryable {
    /// Whether the caller should leave the item unchanged and try again on
    /// the next pass.
    fn is_retryable(&self) -> bool;

    fn to_metrics_label(&self) -> String;
}

impl IsRetryable for TimeboltError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimeboltError::NetworkError(_) | TimeboltError::LockContention(_)
        )
    }

    fn to_metrics_label(&self) -> String {
        match self {
            TimeboltError::NetworkError(_) => "NetworkError",
            TimeboltError::TxSubmissionError(_) => "TxSubmissionError",
            TimeboltError::ChainNotConfigured(_) => "ChainNotConfigured",
            TimeboltError::SlotAlreadyUsed { .. } => "SlotAlreadyUsed",
            TimeboltError::LockContention(_) => "LockContention",
            TimeboltError::DecryptionError(_) => "DecryptionError",
            TimeboltError::PayloadDecodeError(_) => "PayloadDecodeError",
            TimeboltError::EmptyBroadcastSchedule => "EmptyBroadcastSchedule",
            TimeboltError::VirtualClockUnsupported => "VirtualClockUnsupported",
            TimeboltError::Storage(_) => "Storage",
            TimeboltError::EyreError(_) => "EyreError",
        }
        .to_string()
    }
}
