//! One group member as a sans-IO state machine.
//!
//! A [`Node`] owns the membership table, the failure detector, the NAT relay
//! state and the timer registry. The runtime feeds it [`Input`]s one at a
//! time and carries out the [`Effect`]s it returns; nothing inside blocks or
//! performs I/O. Each handler runs to completion, so no locking is needed.

use crate::NodeId;
use crate::address::{Endpoint, NodeAddress};
use crate::context::{Context, Outgoing};
use crate::error::ProtocolViolation;
use crate::nat::{Inbound, NatConfig, NatRelay, PeerSampler, route_inbound, route_outbound};
use crate::protocol::{Datagram, Payload};
use crate::swim::{
    Contact, FailureDetector, FailureDetectorConfig, GossipConfig, MemberStatus, MembershipTable,
};
use crate::timer::{TimerId, TimerOp, TimerPurpose, TimerRegistry};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, error, info, trace, warn};

/// Everything needed to start a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Our own address (open, or NAT-ed with initial parents)
    pub address: NodeAddress,
    /// Seed peers, entered as ALIVE
    pub bootstrap: Vec<NodeAddress>,
    /// Where status reports go, if anywhere
    pub aggregator: Option<Endpoint>,
    pub failure: FailureDetectorConfig,
    pub gossip: GossipConfig,
    pub nat: NatConfig,
    /// Fixed seed for reproducible runs; random when unset
    pub rng_seed: Option<u64>,
}

impl NodeConfig {
    /// Defaults for everything but the address.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            bootstrap: Vec::new(),
            aggregator: None,
            failure: FailureDetectorConfig::default(),
            gossip: GossipConfig::default(),
            nat: NatConfig::default(),
            rng_seed: None,
        }
    }
}

/// Something that happened to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Stop,
    Datagram { from: SocketAddr, datagram: Datagram },
    TimerFired(TimerId),
}

/// Something the runtime must do for the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Transmit { to: SocketAddr, datagram: Datagram },
    Timer(TimerOp),
}

/// One member's row in a [`NodeSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSnapshot {
    pub id: NodeId,
    pub address: String,
    pub status: MemberStatus,
    pub incarnation: u64,
}

/// Point-in-time view of a node, for tooling and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub address: String,
    pub incarnation: u64,
    pub running: bool,
    pub alive: usize,
    pub suspected: usize,
    pub failed: usize,
    pub received_pings: u64,
    pub parents: Vec<NodeId>,
    pub members: Vec<MemberSnapshot>,
}

pub struct Node {
    table: MembershipTable,
    detector: FailureDetector,
    relay: NatRelay,
    timers: TimerRegistry,
    outbox: Vec<Outgoing>,
    rng: StdRng,
    running: bool,
}

impl Node {
    pub fn new(config: NodeConfig, sampler: Box<dyn PeerSampler>) -> Self {
        let mut table = MembershipTable::new(config.address, config.gossip);
        for peer in config.bootstrap {
            table.add_bootstrap(peer);
        }
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            table,
            detector: FailureDetector::new(config.failure, config.aggregator),
            relay: NatRelay::new(config.nat, sampler),
            timers: TimerRegistry::new(),
            outbox: Vec::new(),
            rng,
            running: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.table.local_id()
    }

    pub fn address(&self) -> &NodeAddress {
        self.table.local_address()
    }

    pub fn table(&self) -> &MembershipTable {
        &self.table
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn relay(&self) -> &NatRelay {
        &self.relay
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Process one input and return what the runtime must do.
    ///
    /// An `Err` means a routing invariant was broken; the node must not
    /// continue.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Effect>, ProtocolViolation> {
        let mut effects = Vec::new();
        match input {
            Input::Start => self.start(),
            Input::Stop => self.stop(),
            Input::Datagram { from, datagram } => {
                if !self.running {
                    trace!("{} stopped; ignoring datagram from {}", self.id(), from);
                } else {
                    trace!(
                        "{} recv {} ({} header) from {}",
                        self.id(),
                        datagram.payload.kind(),
                        datagram.header.kind(),
                        from
                    );
                    match route_inbound(self.table.local_address(), datagram) {
                        Ok(Inbound::Deliver { source, payload }) => self.deliver(source, payload),
                        Ok(Inbound::Forward { to, datagram }) => {
                            effects.push(Effect::Transmit { to, datagram })
                        }
                        Ok(Inbound::Drop) => {}
                        Err(violation) => {
                            error!("{} protocol violation: {}", self.id(), violation);
                            return Err(violation);
                        }
                    }
                }
            }
            Input::TimerFired(timer) => match self.timers.fire(timer) {
                Some(purpose) => self.on_timer(purpose),
                None => trace!("{} ignoring stale timer {}", self.id(), timer),
            },
        }

        self.flush(&mut effects)?;
        Ok(effects)
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!(
            "{} starting at {} with {} known peers",
            self.id(),
            self.table.local_address(),
            self.table.len() - 1
        );
        let Self {
            table,
            detector,
            relay,
            timers,
            outbox,
            rng,
            ..
        } = self;
        let mut ctx = Context {
            table,
            timers,
            outbox,
            rng,
        };
        detector.start(&mut ctx);
        relay.start(&mut ctx);
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.timers.cancel_all();
        self.detector.stop();
        self.relay.stop();
        self.outbox.clear();
        info!("{} stopped", self.id());
    }

    fn on_timer(&mut self, purpose: TimerPurpose) {
        let Self {
            table,
            detector,
            relay,
            timers,
            outbox,
            rng,
            ..
        } = self;
        let mut ctx = Context {
            table,
            timers,
            outbox,
            rng,
        };
        match purpose {
            TimerPurpose::ProbeTick => detector.on_probe_tick(&mut ctx),
            TimerPurpose::StatusTick => detector.on_status_tick(&mut ctx),
            TimerPurpose::AckWait { seq } => detector.on_ack_timeout(seq, &mut ctx),
            TimerPurpose::SuspicionWait { seq } => detector.on_suspicion_timeout(seq, &mut ctx),
            TimerPurpose::NatHeartbeat => relay.on_heartbeat(&mut ctx),
            TimerPurpose::ParentPongWait { parent, seq } => {
                relay.on_pong_timeout(parent, seq, &mut ctx)
            }
        }
    }

    fn deliver(&mut self, source: NodeAddress, payload: Payload) {
        if let Payload::Status(_) = payload {
            warn!("{} dropping status report from {}: not an aggregator", self.id(), source.id());
            return;
        }

        match self.table.check_source(&source) {
            Contact::Revived { previous } => {
                info!("{} heard from {} directly; {:?} -> Alive", self.id(), source.id(), previous)
            }
            Contact::Discovered => debug!("{} discovered {}", self.id(), source),
            Contact::Known | Contact::Local => {}
        }

        let Self {
            table,
            detector,
            relay,
            timers,
            outbox,
            rng,
            ..
        } = self;
        let mut ctx = Context {
            table,
            timers,
            outbox,
            rng,
        };
        match payload {
            Payload::Swim(msg) => detector.handle_message(&source, msg, &mut ctx),
            Payload::Nat(msg) => {
                relay.handle_message(&source, msg, &mut ctx);
                detector.ensure_probing(&mut ctx);
            }
            Payload::Status(_) => {}
        }
    }

    /// Route queued messages and collect timer instructions.
    fn flush(&mut self, effects: &mut Vec<Effect>) -> Result<(), ProtocolViolation> {
        for outgoing in std::mem::take(&mut self.outbox) {
            let (to, datagram) =
                route_outbound(self.table.local_address(), outgoing, &mut self.rng).inspect_err(
                    |violation| error!("{} protocol violation: {}", self.table.local_id(), violation),
                )?;
            trace!(
                "{} send {} ({} header) to {}",
                self.table.local_id(),
                datagram.payload.kind(),
                datagram.header.kind(),
                to
            );
            effects.push(Effect::Transmit { to, datagram });
        }
        effects.extend(self.timers.drain_ops().into_iter().map(Effect::Timer));
        Ok(())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let local = self.table.local_record();
        NodeSnapshot {
            id: self.id(),
            address: local.address.to_string(),
            incarnation: local.incarnation,
            running: self.running,
            alive: self.table.alive_count(),
            suspected: self.table.suspected_count(),
            failed: self.table.failed_count(),
            received_pings: self.detector.received_pings(),
            parents: local.address.parents().map(|p| p.id).collect(),
            members: self
                .table
                .records()
                .map(|r| MemberSnapshot {
                    id: r.id(),
                    address: r.address.to_string(),
                    status: r.status,
                    incarnation: r.incarnation,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::{NatMessage, StaticSample};
    use crate::protocol::{DirectHeader, Header};
    use crate::swim::{Piggyback, SwimMessage};

    fn endpoint(id: u32) -> Endpoint {
        Endpoint::new(NodeId::new(id), SocketAddr::from(([127, 0, 0, 1], 7000 + id as u16)))
    }

    fn node(id: u32, peers: &[u32]) -> Node {
        let mut config = NodeConfig::new(NodeAddress::open(endpoint(id)));
        config.bootstrap = peers.iter().map(|p| NodeAddress::open(endpoint(*p))).collect();
        config.rng_seed = Some(id as u64);
        Node::new(config, Box::new(StaticSample::default()))
    }

    fn direct(from: NodeAddress, to: NodeAddress, payload: Payload) -> Input {
        Input::Datagram {
            from: from.socket(),
            datagram: Datagram::new(
                Header::Direct(DirectHeader {
                    source: from,
                    destination: to,
                }),
                payload,
            ),
        }
    }

    fn scheduled(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Timer(TimerOp::Schedule { .. })))
            .count()
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_lone_node_never_probes() {
        let mut n = node(1, &[]);
        let effects = n.handle(Input::Start).unwrap();
        assert_eq!(scheduled(&effects), 0);
        assert!(!n.detector().is_probing());
    }

    #[test]
    fn test_first_contact_arms_probe_timer() {
        let mut n = node(1, &[]);
        n.handle(Input::Start).unwrap();

        let ping = Payload::Swim(SwimMessage::Ping {
            seq: 1,
            piggyback: Piggyback::new(),
        });
        let effects = n
            .handle(direct(NodeAddress::open(endpoint(2)), n.address().clone(), ping.clone()))
            .unwrap();

        assert_eq!(scheduled(&effects), 1);
        assert_eq!(n.timers().count_where(|p| *p == TimerPurpose::ProbeTick), 1);
        // The Pong goes back to the sender
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Transmit { to, datagram } if *to == endpoint(2).socket
                && matches!(datagram.payload, Payload::Swim(SwimMessage::Pong { seq: 1, .. }))
        )));

        // A second peer does not arm another timer
        let effects = n
            .handle(direct(NodeAddress::open(endpoint(3)), n.address().clone(), ping))
            .unwrap();
        assert_eq!(scheduled(&effects), 0);
    }

    #[test]
    fn test_stop_cancels_every_timer() {
        let mut n = node(1, &[2, 3]);
        n.handle(Input::Start).unwrap();
        assert!(!n.timers().is_empty());

        let effects = n.handle(Input::Stop).unwrap();

        assert!(n.timers().is_empty());
        assert!(effects.iter().all(|e| matches!(e, Effect::Timer(TimerOp::Cancel { .. }))));
        assert!(!n.is_running());
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let mut n = node(1, &[2]);
        let effects = n.handle(Input::Start).unwrap();
        let Some(Effect::Timer(TimerOp::Schedule { timer, .. })) = effects.first().cloned() else {
            panic!("expected a scheduled timer");
        };
        n.handle(Input::Stop).unwrap();

        assert!(n.handle(Input::TimerFired(timer)).unwrap().is_empty());
    }

    // ==================== Dispatch ====================

    #[test]
    fn test_probe_tick_sends_ping() {
        let mut n = node(1, &[2]);
        let effects = n.handle(Input::Start).unwrap();
        let probe = effects
            .iter()
            .find_map(|e| match e {
                Effect::Timer(TimerOp::Schedule { timer, periodic: true, .. }) => Some(*timer),
                _ => None,
            })
            .unwrap();

        let effects = n.handle(Input::TimerFired(probe)).unwrap();

        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Transmit { datagram, .. }
                if matches!(datagram.payload, Payload::Swim(SwimMessage::Ping { .. }))
        )));
        assert_eq!(scheduled(&effects), 1); // ack wait
    }

    #[test]
    fn test_direct_contact_revives_failed_member() {
        let mut n = node(1, &[2]);
        n.handle(Input::Start).unwrap();
        let mut piggyback = Piggyback::new();
        piggyback.insert(
            NodeId::new(2),
            crate::swim::PiggybackEntry {
                address: NodeAddress::open(endpoint(2)),
                status: MemberStatus::Failed,
                incarnation: 0,
                remaining_budget: 1,
            },
        );
        n.handle(direct(
            NodeAddress::open(endpoint(3)),
            n.address().clone(),
            Payload::Swim(SwimMessage::FinalPong { seq: 50, piggyback }),
        ))
        .unwrap();
        assert_eq!(n.table().status(&NodeId::new(2)), Some(MemberStatus::Failed));

        n.handle(direct(
            NodeAddress::open(endpoint(2)),
            n.address().clone(),
            Payload::Nat(NatMessage::NatPing { seq: 1 }),
        ))
        .unwrap();
        assert_eq!(n.table().status(&NodeId::new(2)), Some(MemberStatus::Alive));
    }

    #[test]
    fn test_source_header_on_nated_node_is_fatal() {
        let mut config = NodeConfig::new(NodeAddress::nated(endpoint(1), [endpoint(9)]));
        config.rng_seed = Some(1);
        let mut n = Node::new(config, Box::new(StaticSample::default()));
        n.handle(Input::Start).unwrap();

        let input = Input::Datagram {
            from: endpoint(2).socket,
            datagram: Datagram::new(
                Header::Source {
                    inner: DirectHeader {
                        source: NodeAddress::open(endpoint(2)),
                        destination: NodeAddress::nated(endpoint(5), [endpoint(1)]),
                    },
                    parent: endpoint(1),
                },
                Payload::Nat(NatMessage::NatPing { seq: 1 }),
            ),
        };
        assert!(matches!(
            n.handle(input),
            Err(ProtocolViolation::SourceHeaderOnNatedNode { .. })
        ));
    }

    #[test]
    fn test_parent_forwards_for_child() {
        let mut n = node(1, &[]);
        n.handle(Input::Start).unwrap();
        let child = NodeAddress::nated(endpoint(5), [endpoint(1)]);

        let input = Input::Datagram {
            from: endpoint(2).socket,
            datagram: Datagram::new(
                Header::Source {
                    inner: DirectHeader {
                        source: NodeAddress::open(endpoint(2)),
                        destination: child,
                    },
                    parent: endpoint(1),
                },
                Payload::Nat(NatMessage::NatPing { seq: 1 }),
            ),
        };
        let effects = n.handle(input).unwrap();

        assert!(matches!(
            effects.as_slice(),
            [Effect::Transmit { to, datagram }] if *to == endpoint(5).socket
                && matches!(datagram.header, Header::Relay { .. })
        ));
        // Forwarding is not contact: the parent learns nothing about either end
        assert_eq!(n.table().len(), 1);
    }

    #[test]
    fn test_snapshot() {
        let mut n = node(1, &[2, 3]);
        n.handle(Input::Start).unwrap();
        let snapshot = n.snapshot();

        assert_eq!(snapshot.id, NodeId::new(1));
        assert_eq!(snapshot.alive, 3);
        assert_eq!(snapshot.members.len(), 3);
        assert!(snapshot.parents.is_empty());

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: NodeSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
