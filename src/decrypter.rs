//! Contract with the time-lock decryption backend.

use async_trait::async_trait;

use crate::error::TimeboltError;
use crate::execution::QueuedExecution;
use crate::timing::Timing;

/// Outcome of one decryption attempt. Layered ("onion") time-locks surface
/// as `RetryLater` carrying the next encrypted layer and its timing; the
/// scheduler consumes these in a loop rather than through recursive
/// callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionResult {
    /// Cleartext revealed; bytes decode to the execution list.
    Decrypted { payload: Vec<u8> },
    /// Not decryptable yet (or one layer peeled): requeue with the given
    /// payload/timing and try again at `retry_time`.
    RetryLater {
        payload: Vec<u8>,
        timing: Option<Timing>,
        retry_time: u64,
    },
    /// No retry path; the entry is archived as failed.
    PermanentFailure { reason: String },
}

#[async_trait]
pub trait Decrypter: Send + Sync {
    async fn decrypt(&self, execution: &QueuedExecution) -> Result<DecryptionResult, TimeboltError>;
}
