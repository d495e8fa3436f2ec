//! Broadcaster lock acquisition. The lock is a conditional write against the
//! broadcaster row in shared storage, not an in-process mutex, so it holds
//! across multiple worker processes. Stale locks (a worker crashed
//! mid-broadcast) are taken over after a configured timeout; recovery then
//! re-derives nonce state from the chain.

use std::time::Duration;

use primitive_types::H160;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::ChainId;
use crate::error::TimeboltError;
use crate::transaction::Broadcaster;

use super::Executor;

/// Proof of lock ownership; must be handed back to `unlock_broadcaster`.
#[derive(Debug)]
pub(crate) struct LockGuard {
    pub chain_id: ChainId,
    pub address: H160,
    pub token: Uuid,
}

impl Executor {
    pub(crate) async fn lock_broadcaster(
        &self,
        chain_id: ChainId,
        address: H160,
    ) -> Result<(Broadcaster, LockGuard), TimeboltError> {
        let chain = self.chains.get(&chain_id)?;
        let token = Uuid::new_v4();
        let mut attempts: u32 = 0;
        loop {
            let now = chain.protocol.get_timestamp().await?;
            let acquired = self
                .storage
                .acquire_broadcaster_lock(
                    chain_id,
                    address,
                    token,
                    now,
                    self.config.lock_stale_timeout,
                )
                .await?;
            if let Some(broadcaster) = acquired {
                return Ok((
                    broadcaster,
                    LockGuard {
                        chain_id,
                        address,
                        token,
                    },
                ));
            }
            attempts = attempts.saturating_add(1);
            if !self.config.wait_for_lock || attempts >= self.config.lock_attempts {
                warn!(%chain_id, ?address, attempts, "Broadcaster lock contended, giving up");
                return Err(TimeboltError::LockContention(address));
            }
            info!(%chain_id, ?address, attempts, "Broadcaster lock contended, retrying");
            sleep(Duration::from_millis(self.config.lock_retry_delay_ms)).await;
        }
    }

    pub(crate) async fn unlock_broadcaster(&self, guard: LockGuard) -> Result<(), TimeboltError> {
        self.storage
            .release_broadcaster_lock(guard.chain_id, guard.address, guard.token)
            .await?;
        Ok(())
    }
}
