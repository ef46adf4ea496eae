//! NAT relay layer.
//!
//! Decides the envelope of every outgoing message, forwards traffic for
//! NAT-ed children when we are their parent, and, when we are NAT-ed
//! ourselves, keeps our relay parents alive:
//!
//! - every heartbeat, NatPing each parent and wait for its NatPong
//! - a parent that misses [`MISSES_BEFORE_REPLACEMENT`] pongs in a row
//!   triggers a NatRequest for up to `max_candidate_parents` replacements
//!   from the peer sample
//! - the NatResponse to our latest request replaces our parents and our own
//!   address is re-announced (incarnation bump) so the group learns the new
//!   route
//!
//! The current parent set lives in our own membership record; this module is
//! the only one that changes it.

use super::messages::NatMessage;
use super::sampler::PeerSampler;
use crate::NodeId;
use crate::address::{Endpoint, NodeAddress};
use crate::context::{Context, Outgoing};
use crate::error::ProtocolViolation;
use crate::protocol::{Datagram, DirectHeader, Header, Payload};
use crate::timer::{TimerId, TimerPurpose};
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive missed pongs before a parent is replaced.
pub const MISSES_BEFORE_REPLACEMENT: u32 = 2;

/// Configuration for parent liveness.
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// How often parents are pinged (default: 1s)
    pub heartbeat_interval: Duration,
    /// How long a parent has to answer (default: 2s)
    pub pong_timeout: Duration,
    /// Most parents asked for at once when replacing (default: 2)
    pub max_candidate_parents: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            pong_timeout: Duration::from_secs(2),
            max_candidate_parents: 2,
        }
    }
}

/// What to do with a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Addressed to us: hand to the protocol handlers.
    Deliver { source: NodeAddress, payload: Payload },
    /// We are the destination's parent: pass it on.
    Forward { to: SocketAddr, datagram: Datagram },
    /// Not for us.
    Drop,
}

/// Choose the envelope and next hop for an outgoing message.
pub fn route_outbound(
    local: &NodeAddress,
    outgoing: Outgoing,
    rng: &mut impl Rng,
) -> Result<(SocketAddr, Datagram), ProtocolViolation> {
    let (destination, payload) = match outgoing {
        Outgoing::Direct { to, payload } => (NodeAddress::open(to), payload),
        Outgoing::Routed { to, payload } => (to, payload),
    };
    let next_hop;
    let header;
    if destination.is_open() {
        next_hop = destination.socket();
        header = Header::Direct(DirectHeader {
            source: local.clone(),
            destination,
        });
    } else if destination.has_parent(local.id()) {
        // We are one of its parents: skip the detour through ourselves
        next_hop = destination.socket();
        header = Header::Relay {
            inner: DirectHeader {
                source: local.clone(),
                destination,
            },
            relayed_by: local.endpoint,
        };
    } else {
        let parents: Vec<Endpoint> = destination.parents().copied().collect();
        let Some(parent) = parents.choose(rng).copied() else {
            return Err(ProtocolViolation::NatedDestinationWithoutParents {
                local: local.id(),
                destination: destination.id(),
            });
        };
        next_hop = parent.socket;
        header = Header::Source {
            inner: DirectHeader {
                source: local.clone(),
                destination,
            },
            parent,
        };
    }
    Ok((next_hop, Datagram::new(header, payload)))
}

/// Unwrap a received datagram.
///
/// Source headers are only valid at an open node and relay headers only at a
/// NAT-ed one; anything else is a misconfiguration and fatal.
pub fn route_inbound(local: &NodeAddress, datagram: Datagram) -> Result<Inbound, ProtocolViolation> {
    let Datagram {
        version,
        header,
        payload,
    } = datagram;
    match header {
        Header::Direct(inner) => {
            if inner.destination.id() != local.id() {
                warn!(
                    "{} dropping {} for {} from {}",
                    local.id(),
                    payload.kind(),
                    inner.destination.id(),
                    inner.source.id()
                );
                return Ok(Inbound::Drop);
            }
            Ok(Inbound::Deliver {
                source: inner.source,
                payload,
            })
        }
        Header::Source { inner, .. } => {
            if !local.is_open() {
                return Err(ProtocolViolation::SourceHeaderOnNatedNode {
                    local: local.id(),
                    source_id: inner.source.id(),
                });
            }
            if !inner.destination.has_parent(local.id()) {
                warn!(
                    "{} not a parent of {}; dropping {} from {}",
                    local.id(),
                    inner.destination.id(),
                    payload.kind(),
                    inner.source.id()
                );
                return Ok(Inbound::Drop);
            }
            debug!(
                "{} relaying {} from {} to {}",
                local.id(),
                payload.kind(),
                inner.source.id(),
                inner.destination.id()
            );
            let to = inner.destination.socket();
            Ok(Inbound::Forward {
                to,
                datagram: Datagram {
                    version,
                    header: Header::Relay {
                        inner,
                        relayed_by: local.endpoint,
                    },
                    payload,
                },
            })
        }
        Header::Relay { inner, relayed_by } => {
            if local.is_open() {
                return Err(ProtocolViolation::RelayHeaderOnOpenNode {
                    local: local.id(),
                    source_id: inner.source.id(),
                });
            }
            debug!(
                "{} received {} from {} via {}",
                local.id(),
                payload.kind(),
                inner.source.id(),
                relayed_by.id
            );
            Ok(Inbound::Deliver {
                source: inner.source,
                payload,
            })
        }
    }
}

/// Parent-liveness state of one node.
pub struct NatRelay {
    config: NatConfig,
    sampler: Box<dyn PeerSampler>,
    heartbeat_timer: Option<TimerId>,
    /// Outstanding NatPings: seq -> (parent, pong-wait timer)
    pending_pongs: HashMap<u64, (Endpoint, TimerId)>,
    /// Consecutive missed pongs per parent; a pong clears the entry
    missed: BTreeMap<NodeId, u32>,
    /// Our outstanding NatRequest: (seq, helper asked)
    pending_request: Option<(u64, NodeId)>,
    /// Last sample pulled from the sampler
    sample: Vec<Endpoint>,
    next_seq: u64,
}

impl NatRelay {
    pub fn new(config: NatConfig, sampler: Box<dyn PeerSampler>) -> Self {
        Self {
            config,
            sampler,
            heartbeat_timer: None,
            pending_pongs: HashMap::new(),
            missed: BTreeMap::new(),
            pending_request: None,
            sample: Vec::new(),
            next_seq: 1,
        }
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Parents with a NatPing outstanding.
    pub fn pending_parents(&self) -> impl Iterator<Item = &Endpoint> {
        self.pending_pongs.values().map(|(parent, _)| parent)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Arm the heartbeat if we are NAT-ed.
    pub fn start(&mut self, ctx: &mut Context<'_>) {
        if ctx.table.local_address().is_open() || self.heartbeat_timer.is_some() {
            return;
        }
        self.heartbeat_timer = Some(ctx.timers.schedule(
            TimerPurpose::NatHeartbeat,
            self.config.heartbeat_interval,
            true,
        ));
    }

    /// Forget all outstanding pings. The caller cancels the timers.
    pub fn stop(&mut self) {
        self.heartbeat_timer = None;
        self.pending_pongs.clear();
        self.missed.clear();
        self.pending_request = None;
    }

    /// Ping every current parent.
    pub fn on_heartbeat(&mut self, ctx: &mut Context<'_>) {
        self.refresh_sample(ctx);
        let parents: Vec<Endpoint> = ctx.table.local_address().parents().copied().collect();
        for parent in parents {
            let seq = self.next_seq();
            let timer = ctx.timers.schedule(
                TimerPurpose::ParentPongWait { parent, seq },
                self.config.pong_timeout,
                false,
            );
            self.pending_pongs.insert(seq, (parent, timer));
            ctx.send_direct(parent, Payload::Nat(NatMessage::NatPing { seq }));
        }
    }

    fn refresh_sample(&mut self, ctx: &Context<'_>) {
        self.sample = self.sampler.current_sample();
        if self.sample.is_empty() {
            self.sample = ctx.table.open_alive_endpoints();
        }
    }

    /// The NatRequest we are waiting on, if any.
    pub fn pending_request(&self) -> Option<u64> {
        self.pending_request.map(|(seq, _)| seq)
    }

    /// A parent missed its pong: after enough misses in a row, ask for
    /// replacements.
    pub fn on_pong_timeout(&mut self, parent: Endpoint, seq: u64, ctx: &mut Context<'_>) {
        let local = ctx.table.local_address().clone();
        if self.pending_pongs.remove(&seq).is_none() || !local.has_parent(parent.id) {
            return;
        }
        let misses = self.missed.entry(parent.id).or_insert(0);
        *misses += 1;
        let misses = *misses;
        if misses < MISSES_BEFORE_REPLACEMENT {
            debug!("{} parent {} missed a pong ({} in a row)", local.id(), parent.id, misses);
            return;
        }
        info!("{} parent {} missed {} pongs in a row", local.id(), parent.id, misses);

        if self.sample.is_empty() {
            self.refresh_sample(ctx);
        }
        let mut pool: Vec<Endpoint> = self
            .sample
            .iter()
            .copied()
            .filter(|e| e.id != local.id() && !local.has_parent(e.id))
            .collect();
        if pool.is_empty() {
            warn!("{} no candidate parents to replace {}", local.id(), parent.id);
            return;
        }
        pool.shuffle(&mut *ctx.rng);
        pool.truncate(self.config.max_candidate_parents);

        // A parent that still answers, or else anyone from the sample
        let live_parent = local
            .parents()
            .copied()
            .find(|p| !self.missed.contains_key(&p.id));
        let reachable: Vec<Endpoint> = self
            .sample
            .iter()
            .copied()
            .filter(|e| e.id != local.id() && !self.missed.contains_key(&e.id))
            .collect();
        let Some(helper) = live_parent.or_else(|| reachable.choose(&mut *ctx.rng).copied()) else {
            return;
        };

        // A newer request supersedes any we are still waiting on
        let seq = self.next_seq();
        self.pending_request = Some((seq, helper.id));
        debug!(
            "{} nat request {} to {} for {:?}",
            local.id(),
            seq,
            helper.id,
            pool.iter().map(|e| e.id.as_u32()).collect::<Vec<_>>()
        );
        ctx.send_direct(
            helper,
            Payload::Nat(NatMessage::NatRequest {
                seq,
                candidates: pool.into_iter().collect(),
            }),
        );
    }

    /// Handle a NAT message from `from`.
    pub fn handle_message(&mut self, from: &NodeAddress, msg: NatMessage, ctx: &mut Context<'_>) {
        let local = ctx.table.local_id();
        match msg {
            NatMessage::NatPing { seq } => {
                ctx.send_direct(from.endpoint, Payload::Nat(NatMessage::NatPong { seq }));
            }
            NatMessage::NatPong { seq } => {
                if let Some((parent, timer)) = self.pending_pongs.remove(&seq) {
                    ctx.timers.cancel(timer);
                    self.missed.remove(&parent.id);
                }
            }
            NatMessage::NatRequest { seq, candidates } => {
                let parents: BTreeSet<Endpoint> = candidates
                    .into_iter()
                    .filter(|c| c.id != from.id() && ctx.table.is_alive(&c.id))
                    .collect();
                debug!(
                    "{} vouching for {} of the candidates {} asked about",
                    local,
                    parents.len(),
                    from.id()
                );
                ctx.send_direct(from.endpoint, Payload::Nat(NatMessage::NatResponse { seq, parents }));
            }
            NatMessage::NatResponse { seq, parents } => {
                if self.pending_request != Some((seq, from.id())) {
                    debug!("{} ignoring unexpected nat response {} from {}", local, seq, from.id());
                    return;
                }
                self.pending_request = None;
                self.replace_parents(parents, ctx);
            }
        }
    }

    fn replace_parents(&mut self, parents: BTreeSet<Endpoint>, ctx: &mut Context<'_>) {
        let current = ctx.table.local_address().clone();
        if current.is_open() {
            return;
        }
        if parents.is_empty() {
            warn!("{} no candidate parent confirmed; keeping current parents", current.id());
            return;
        }
        let updated = current.with_parents(parents);
        if updated == current {
            return;
        }

        // Stop waiting on parents we are dropping
        let stale: Vec<u64> = self
            .pending_pongs
            .iter()
            .filter(|(_, (parent, _))| !updated.has_parent(parent.id))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            if let Some((_, timer)) = self.pending_pongs.remove(&seq) {
                ctx.timers.cancel(timer);
            }
        }
        self.missed.clear();

        info!("{} new parents: {}", current.id(), updated);
        ctx.table.update_local_address(updated);
    }
}
