//! Membership table: every known member and what we believe about it.
//!
//! The table is the single owner of membership state for one node. It tracks:
//! - All known members, including ourselves
//! - Their current status (New, Alive, Suspected, Failed)
//! - Incarnation numbers for conflict resolution
//! - How many more gossip rounds each record must still be piggybacked
//!
//! A status field per record (rather than one map per status) makes "an
//! identity lives in exactly one of alive/suspected/failed" hold by
//! construction. Records are never deleted; Failed members stay for the
//! lifetime of the node.
//!
//! Gossip construction and merging live in [`super::gossip`].

use super::gossip::GossipConfig;
use super::messages::PiggybackEntry;
use crate::NodeId;
use crate::address::{Endpoint, NodeAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    /// Just discovered. Counted as alive; promoted to Alive after its first
    /// full gossip round.
    New,
    /// Believed to be alive.
    Alive,
    /// Missed a probe, might be dead.
    Suspected,
    /// Declared dead. Only direct contact brings it back.
    Failed,
}

impl MemberStatus {
    /// New and Alive both belong to the alive set.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::New | Self::Alive)
    }
}

/// One known member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    /// Where the member can be reached
    pub address: NodeAddress,
    /// Current belief about the member
    pub status: MemberStatus,
    /// Incarnation number (orders competing claims, never decreases)
    pub incarnation: u64,
    /// Remaining gossip rounds this record is piggybacked on
    pub budget: u32,
}

impl MemberRecord {
    pub fn new(address: NodeAddress, status: MemberStatus, incarnation: u64, budget: u32) -> Self {
        Self {
            address,
            status,
            incarnation,
            budget,
        }
    }

    pub fn id(&self) -> NodeId {
        self.address.id()
    }

    /// Wire form of this record.
    pub fn to_entry(&self) -> PiggybackEntry {
        PiggybackEntry {
            address: self.address.clone(),
            status: self.status,
            incarnation: self.incarnation,
            remaining_budget: self.budget,
        }
    }
}

/// Result of applying the direct-contact rule to a message source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contact {
    /// The source is ourselves (looped-back message); nothing changes.
    Local,
    /// Already in the alive set.
    Known,
    /// Was Suspected or Failed and is Alive again.
    Revived { previous: MemberStatus },
    /// Never heard of before; inserted as New.
    Discovered,
}

/// The per-node membership table.
pub struct MembershipTable {
    /// Our own identity
    local_id: NodeId,
    /// Every known member, ourselves included, ordered by identity
    records: BTreeMap<NodeId, MemberRecord>,
    /// Dissemination and merge settings
    pub(super) gossip: GossipConfig,
}

impl MembershipTable {
    /// Create a table containing only ourselves, as New.
    pub fn new(local: NodeAddress, gossip: GossipConfig) -> Self {
        let local_id = local.id();
        let mut table = Self {
            local_id,
            records: BTreeMap::new(),
            gossip,
        };
        let budget = table.full_budget();
        table
            .records
            .insert(local_id, MemberRecord::new(local, MemberStatus::New, 0, budget));
        table
    }

    /// Get our local node ID.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Get our own record.
    pub fn local_record(&self) -> &MemberRecord {
        // The local record is inserted in `new` and never removed.
        &self.records[&self.local_id]
    }

    /// Get our advertised address.
    pub fn local_address(&self) -> &NodeAddress {
        &self.local_record().address
    }

    /// Get our local incarnation.
    pub fn local_incarnation(&self) -> u64 {
        self.local_record().incarnation
    }

    /// Dissemination budget for a record created or refreshed now.
    pub fn full_budget(&self) -> u32 {
        self.gossip.budget_for(self.records.len())
    }

    /// Add a bootstrap peer as Alive.
    ///
    /// Returns false for ourselves or an already known peer.
    pub fn add_bootstrap(&mut self, address: NodeAddress) -> bool {
        let id = address.id();
        if id == self.local_id || self.records.contains_key(&id) {
            return false;
        }
        let budget = self.gossip.budget_for(self.records.len() + 1);
        self.records
            .insert(id, MemberRecord::new(address, MemberStatus::Alive, 0, budget));
        true
    }

    /// Get a member by ID.
    pub fn get(&self, id: &NodeId) -> Option<&MemberRecord> {
        self.records.get(id)
    }

    /// Check if a member is known.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.records.contains_key(id)
    }

    /// Current status of a member.
    pub fn status(&self, id: &NodeId) -> Option<MemberStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Check if a member is in the alive set (New or Alive).
    pub fn is_alive(&self, id: &NodeId) -> bool {
        self.status(id).is_some_and(|s| s.is_alive())
    }

    /// All records, ordered by identity.
    pub fn records(&self) -> impl Iterator<Item = &MemberRecord> {
        self.records.values()
    }

    /// Number of known members, ourselves included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The table always contains at least ourselves.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Members eligible for probing: alive or suspected, excluding ourselves.
    ///
    /// Ordered by identity.
    pub fn probe_candidates(&self) -> Vec<NodeId> {
        self.records
            .values()
            .filter(|r| r.id() != self.local_id && r.status != MemberStatus::Failed)
            .map(|r| r.id())
            .collect()
    }

    /// Number of members in the alive set, ourselves included.
    pub fn alive_count(&self) -> usize {
        self.count(|s| s.is_alive())
    }

    pub fn suspected_count(&self) -> usize {
        self.count(|s| s == MemberStatus::Suspected)
    }

    pub fn failed_count(&self) -> usize {
        self.count(|s| s == MemberStatus::Failed)
    }

    fn count(&self, pred: impl Fn(MemberStatus) -> bool) -> usize {
        self.records.values().filter(|r| pred(r.status)).count()
    }

    /// Open endpoints of alive members other than ourselves.
    pub fn open_alive_endpoints(&self) -> Vec<Endpoint> {
        self.records
            .values()
            .filter(|r| r.id() != self.local_id && r.status.is_alive() && r.address.is_open())
            .map(|r| r.address.endpoint)
            .collect()
    }

    /// Apply the direct-contact rule for the source of any received message.
    ///
    /// Hearing from a member directly beats any secondhand claim about it:
    /// - Suspected/Failed members become Alive with a bumped incarnation and
    ///   a fresh budget
    /// - Unknown members are inserted as New
    ///
    /// The stored address is refreshed when the source now advertises a
    /// different one (e.g. new relay parents).
    pub fn check_source(&mut self, source: &NodeAddress) -> Contact {
        let id = source.id();
        if id == self.local_id {
            return Contact::Local;
        }

        let budget = self.full_budget();
        match self.records.get_mut(&id) {
            Some(record) => {
                if record.address != *source {
                    record.address = source.clone();
                }
                match record.status {
                    MemberStatus::New | MemberStatus::Alive => Contact::Known,
                    previous @ (MemberStatus::Suspected | MemberStatus::Failed) => {
                        record.status = MemberStatus::Alive;
                        record.incarnation = record.incarnation.saturating_add(1);
                        record.budget = budget;
                        Contact::Revived { previous }
                    }
                }
            }
            None => {
                let budget = self.gossip.budget_for(self.records.len() + 1);
                self.records.insert(
                    id,
                    MemberRecord::new(source.clone(), MemberStatus::New, 0, budget),
                );
                Contact::Discovered
            }
        }
    }

    /// Mark a member Suspected after a missed ack.
    ///
    /// Keeps the member's incarnation and resets its budget so the suspicion
    /// spreads. Returns true if the status changed.
    pub fn mark_suspected(&mut self, id: NodeId) -> bool {
        if id == self.local_id {
            return false;
        }
        let budget = self.full_budget();
        match self.records.get_mut(&id) {
            Some(record) if record.status.is_alive() => {
                record.status = MemberStatus::Suspected;
                record.budget = budget;
                true
            }
            _ => false,
        }
    }

    /// Declare a member Failed after its suspicion timed out.
    ///
    /// Returns true if the status changed.
    pub fn mark_failed(&mut self, id: NodeId) -> bool {
        if id == self.local_id {
            return false;
        }
        let budget = self.full_budget();
        match self.records.get_mut(&id) {
            Some(record) if record.status != MemberStatus::Failed => {
                record.status = MemberStatus::Failed;
                record.budget = budget;
                true
            }
            _ => false,
        }
    }

    /// Clear a suspicion after an indirect ack proved the member alive.
    ///
    /// Failed stays Failed: only direct contact resurrects. Returns true if
    /// the status changed.
    pub fn mark_alive(&mut self, id: NodeId) -> bool {
        let budget = self.full_budget();
        match self.records.get_mut(&id) {
            Some(record) if record.status == MemberStatus::Suspected => {
                record.status = MemberStatus::Alive;
                record.incarnation = record.incarnation.saturating_add(1);
                record.budget = budget;
                true
            }
            _ => false,
        }
    }

    /// Refute a claim that we are Suspected or Failed.
    ///
    /// Our incarnation jumps past the claim so that our Alive outranks it.
    pub fn refute(&mut self, claimed_incarnation: u64) -> u64 {
        let budget = self.full_budget();
        let local_id = self.local_id;
        let Some(record) = self.records.get_mut(&local_id) else {
            return claimed_incarnation.saturating_add(1);
        };
        record.incarnation = record.incarnation.max(claimed_incarnation).saturating_add(1);
        record.status = MemberStatus::Alive;
        record.budget = budget;
        record.incarnation
    }

    /// Announce a new local address (e.g. after our relay parents changed).
    pub fn update_local_address(&mut self, address: NodeAddress) {
        let budget = self.full_budget();
        let local_id = self.local_id;
        let Some(record) = self.records.get_mut(&local_id) else {
            return;
        };
        record.address = address;
        record.incarnation = record.incarnation.saturating_add(1);
        record.budget = budget;
    }

    pub(super) fn record_mut(&mut self, id: &NodeId) -> Option<&mut MemberRecord> {
        self.records.get_mut(id)
    }

    pub(super) fn insert(&mut self, record: MemberRecord) {
        self.records.insert(record.id(), record);
    }

    pub(super) fn records_mut(&mut self) -> impl Iterator<Item = &mut MemberRecord> {
        self.records.values_mut()
    }
}
