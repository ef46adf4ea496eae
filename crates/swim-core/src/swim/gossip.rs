//! Infection-style dissemination.
//!
//! Every outgoing SWIM message carries a piggyback built from the membership
//! table; every incoming one is merged back into it. Each record is
//! re-broadcast a bounded number of times (its budget), proportional to the
//! log of the group size, which caps total gossip volume.
//!
//! Merge precedence is FAILED > SUSPECTED > ALIVE > NEW, ordered further by
//! incarnation. Claims about ourselves are never accepted; a claim that we are
//! suspected or failed is refuted by bumping our own incarnation.

use super::membership::{MemberRecord, MemberStatus, MembershipTable};
use super::messages::{Piggyback, PiggybackEntry};
use crate::NodeId;
use tracing::warn;

/// Incarnation comparison used when a SUSPECTED claim meets a local ALIVE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncarnationPolicy {
    /// Accept the suspicion if its incarnation is at least ours.
    #[default]
    GreaterOrEqual,
    /// Accept the suspicion only if its incarnation is newer than ours.
    StrictlyGreater,
}

impl IncarnationPolicy {
    pub fn accepts(&self, incoming: u64, local: u64) -> bool {
        match self {
            Self::GreaterOrEqual => incoming >= local,
            Self::StrictlyGreater => incoming > local,
        }
    }
}

/// Gossip tuning.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Constant `C` in `round(C * log10(N))`
    pub dissemination_factor: f64,
    /// Expected group size; used when larger than the number of known members
    pub group_size_hint: Option<usize>,
    /// How a SUSPECTED claim is compared against a local ALIVE record
    pub suspicion_policy: IncarnationPolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            dissemination_factor: 4.0,
            group_size_hint: None,
            suspicion_policy: IncarnationPolicy::GreaterOrEqual,
        }
    }
}

impl GossipConfig {
    /// Budget for a record created or refreshed when `known` members are known.
    pub fn budget_for(&self, known: usize) -> u32 {
        let n = known.max(self.group_size_hint.unwrap_or(0)).max(2);
        dissemination_budget(self.dissemination_factor, n)
    }
}

/// `max(1, round(C * log10(N)))`.
pub fn dissemination_budget(factor: f64, group_size: usize) -> u32 {
    let n = group_size.max(2) as f64;
    let budget = (factor * n.log10()).round();
    if budget.is_finite() && budget >= 1.0 {
        budget as u32
    } else {
        1
    }
}

/// A change made to the table while merging a piggyback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeChange {
    /// Someone claimed we were suspected or failed; we bumped our incarnation.
    Refuted {
        claimed: MemberStatus,
        incarnation: u64,
    },
    /// A member's status changed (or it was added, when `from` is `None`).
    Status {
        id: NodeId,
        from: Option<MemberStatus>,
        to: MemberStatus,
    },
}

impl MembershipTable {
    /// Build the piggyback for one outgoing message.
    ///
    /// Every record with budget left is included and its budget decremented,
    /// so a record with budget B rides on exactly B messages. A NEW record
    /// whose budget ran out is promoted to ALIVE with a fresh budget instead
    /// of being dropped.
    pub fn build_piggyback(&mut self) -> Piggyback {
        let fresh = self.full_budget();
        let mut piggyback = Piggyback::new();
        for record in self.records_mut() {
            if record.budget > 0 {
                record.budget -= 1;
            } else if record.status == MemberStatus::New {
                record.status = MemberStatus::Alive;
                record.budget = fresh;
            } else {
                continue;
            }
            piggyback.insert(record.id(), record.to_entry());
        }
        piggyback
    }

    /// Merge an incoming piggyback into the table.
    ///
    /// Returns what changed, for logging.
    pub fn merge_piggyback(&mut self, piggyback: &Piggyback) -> Vec<MergeChange> {
        let mut changes = Vec::new();
        for (id, entry) in piggyback {
            if *id != entry.address.id() {
                warn!(
                    "{} dropping piggyback entry keyed {} for {}",
                    self.local_id(),
                    id,
                    entry.address
                );
                continue;
            }
            if *id == self.local_id() {
                if matches!(entry.status, MemberStatus::Suspected | MemberStatus::Failed) {
                    let incarnation = self.refute(entry.incarnation);
                    changes.push(MergeChange::Refuted {
                        claimed: entry.status,
                        incarnation,
                    });
                }
                continue;
            }
            if let Some(change) = self.merge_entry(entry) {
                changes.push(change);
            }
        }
        changes
    }

    fn merge_entry(&mut self, entry: &PiggybackEntry) -> Option<MergeChange> {
        let id = entry.address.id();
        let fresh = self.full_budget();
        let policy = self.gossip.suspicion_policy;

        let Some(local) = self.record_mut(&id) else {
            return match entry.status {
                MemberStatus::New | MemberStatus::Alive => {
                    let budget = self.gossip.budget_for(self.len() + 1);
                    self.insert(MemberRecord::new(
                        entry.address.clone(),
                        entry.status,
                        entry.incarnation,
                        budget,
                    ));
                    Some(MergeChange::Status {
                        id,
                        from: None,
                        to: entry.status,
                    })
                }
                // Nothing to suspect or fail
                MemberStatus::Suspected | MemberStatus::Failed => None,
            };
        };

        let from = local.status;
        let incarnation = local.incarnation.max(entry.incarnation);
        let accept = match (entry.status, from) {
            // A rejoining member clears any suspicion or failure
            (MemberStatus::New, MemberStatus::Suspected | MemberStatus::Failed) => true,
            (MemberStatus::New, _) => {
                // Already alive here: only catch up on incarnation and address
                if entry.incarnation > local.incarnation {
                    local.incarnation = entry.incarnation;
                    local.address = entry.address.clone();
                    local.budget = fresh;
                }
                return None;
            }
            (MemberStatus::Alive, MemberStatus::New | MemberStatus::Alive | MemberStatus::Suspected) => {
                entry.incarnation > local.incarnation
            }
            (MemberStatus::Alive, MemberStatus::Failed) => false,
            (MemberStatus::Failed, MemberStatus::Failed) => false,
            (MemberStatus::Failed, _) => true,
            (MemberStatus::Suspected, MemberStatus::New | MemberStatus::Alive) => {
                policy.accepts(entry.incarnation, local.incarnation)
            }
            (MemberStatus::Suspected, MemberStatus::Suspected) => {
                entry.incarnation > local.incarnation
            }
            (MemberStatus::Suspected, MemberStatus::Failed) => false,
        };
        if !accept {
            return None;
        }

        // Suspicion and failure claims say nothing about where the member lives
        if matches!(entry.status, MemberStatus::New | MemberStatus::Alive) {
            local.address = entry.address.clone();
        }
        local.status = entry.status;
        local.incarnation = incarnation;
        local.budget = fresh;
        (from != entry.status).then_some(MergeChange::Status {
            id,
            from: Some(from),
            to: entry.status,
        })
    }
}
