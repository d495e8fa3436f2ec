//! Fee-escalation schedule: an ordered, non-empty sequence of fee tiers,
//! each active for a cumulative duration window measured from the first
//! broadcast attempt.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::chain::GasFeeEstimate;
use crate::error::TimeboltError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTier {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    /// Seconds this tier stays active before the next one takes over. The
    /// last tier has no implicit expiry beyond the execution's own.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSchedule {
    tiers: Vec<FeeTier>,
}

// Stored records deserialize through `new()` so the non-empty invariant
// holds for every constructed value, not just freshly built ones.
impl<'de> Deserialize<'de> for BroadcastSchedule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr {
            tiers: Vec<FeeTier>,
        }
        let repr = Repr::deserialize(deserializer)?;
        BroadcastSchedule::new(repr.tiers).map_err(serde::de::Error::custom)
    }
}

impl BroadcastSchedule {
    pub fn new(tiers: Vec<FeeTier>) -> Result<Self, TimeboltError> {
        if tiers.is_empty() {
            return Err(TimeboltError::EmptyBroadcastSchedule);
        }
        Ok(Self { tiers })
    }

    /// Default schedule for an execution authorized up to
    /// `max_fee_per_gas_authorized`: `tier_count` evenly spaced fee steps
    /// ending at the full authorization, floored at the current estimate so
    /// tier 0 is broadcastable right away.
    pub fn for_authorized_fee(
        max_fee_per_gas_authorized: U256,
        estimate: &GasFeeEstimate,
        tier_count: u32,
        tier_duration: u64,
    ) -> Result<Self, TimeboltError> {
        let tier_count = tier_count.max(1);
        let floor = estimate.max_fee_per_gas.min(max_fee_per_gas_authorized);
        let tiers = (1..=tier_count)
            .map(|step| {
                let fraction = max_fee_per_gas_authorized
                    .saturating_mul(U256::from(step))
                    .checked_div(U256::from(tier_count))
                    .unwrap_or(max_fee_per_gas_authorized);
                let max_fee_per_gas = fraction.max(floor);
                FeeTier {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: estimate
                        .max_priority_fee_per_gas
                        .min(max_fee_per_gas),
                    duration: tier_duration,
                }
            })
            .collect();
        Self::new(tiers)
    }

    pub fn first(&self) -> &FeeTier {
        // non-empty by construction
        &self.tiers[0]
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// The tier active after `elapsed` seconds since the first broadcast
    /// attempt. The last tier is sticky.
    pub fn tier_at(&self, elapsed: u64) -> (usize, &FeeTier) {
        let mut cumulative: u64 = 0;
        for (index, tier) in self.tiers.iter().enumerate() {
            cumulative = cumulative.saturating_add(tier.duration);
            if elapsed < cumulative {
                return (index, tier);
            }
        }
        let last = self.tiers.len().saturating_sub(1);
        (last, &self.tiers[last])
    }

    /// Seconds until the next tier boundary after `elapsed`; on the last
    /// tier, its own duration serves as the re-check cadence.
    pub fn next_check_delay(&self, elapsed: u64) -> u64 {
        let mut cumulative: u64 = 0;
        for tier in &self.tiers {
            cumulative = cumulative.saturating_add(tier.duration);
            if elapsed < cumulative {
                return cumulative.saturating_sub(elapsed);
            }
        }
        let last = self.tiers.len().saturating_sub(1);
        self.tiers[last].duration.max(1)
    }
}
