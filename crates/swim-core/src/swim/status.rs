//! Periodic membership snapshot sent to the aggregator.

use super::membership::MembershipTable;
use serde::{Deserialize, Serialize};

/// Counts reported on every status tick. Purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Pings (direct and indirect) this node has answered so far
    pub received_pings: u64,
    /// Members believed alive, including ourselves
    pub alive: u32,
    pub suspected: u32,
    pub failed: u32,
}

impl StatusReport {
    pub fn capture(table: &MembershipTable, received_pings: u64) -> Self {
        Self {
            received_pings,
            alive: saturating_count(table.alive_count()),
            suspected: saturating_count(table.suspected_count()),
            failed: saturating_count(table.failed_count()),
        }
    }

    /// The `(alive, suspected, failed)` triple nodes must agree on to have converged.
    pub fn view(&self) -> (u32, u32, u32) {
        (self.alive, self.suspected, self.failed)
    }
}

fn saturating_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
