//! SWIM (Scalable Weakly-consistent Infection-style Membership) protocol.
//!
//! # Protocol Overview
//!
//! **Failure Detection:**
//! 1. Each tick, ping the next member in round-robin order
//! 2. If no ack within timeout, suspect it and ask k helpers to probe it
//! 3. If no helper confirms it before the suspicion timeout, mark it failed
//! 4. Hearing from a member directly always brings it back
//!
//! **Gossip Dissemination:**
//! - Every probe and reply carries a piggyback of membership records
//! - Each record rides on `round(C * log10(N))` messages, then stops
//! - Incarnation numbers order competing claims about the same member

pub mod failure;
pub mod gossip;
pub mod membership;
pub mod messages;
pub mod status;

pub use failure::{FailureDetector, FailureDetectorConfig, ProbeContext};
pub use gossip::{GossipConfig, IncarnationPolicy, MergeChange, dissemination_budget};
pub use membership::{Contact, MemberRecord, MemberStatus, MembershipTable};
pub use messages::{Piggyback, PiggybackEntry, SwimMessage};
pub use status::StatusReport;
