//! SWIM failure detection.
//!
//! One probe round per tick:
//! 1. Ping the next member in round-robin order and wait for a Pong
//! 2. If no ack in time, suspect the target and ask k random helpers to
//!    probe it on our behalf (PingReq)
//! 3. A helper pings the target (IndirectPing); the target answers the
//!    helper (IndirectPong), which forwards a FinalPong to us
//! 4. If no FinalPong arrives before the suspicion timeout, mark the target
//!    failed
//!
//! Rounds are keyed by sequence number. Every timer belonging to a round is
//! cancelled when the round resolves, and a timer that fires for a round
//! that is gone is ignored.

use super::membership::MemberStatus;
use super::messages::SwimMessage;
use super::status::StatusReport;
use crate::NodeId;
use crate::address::{Endpoint, NodeAddress};
use crate::context::Context;
use crate::protocol::Payload;
use crate::swim::gossip::MergeChange;
use crate::timer::{TimerId, TimerPurpose};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for failure detection.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// How often to start a probe round (default: 1s)
    pub probe_interval: Duration,
    /// How long to wait for a Pong before indirect probing (default: 2s)
    pub ack_timeout: Duration,
    /// How long indirect probing may take before the target fails (default: 3s)
    pub suspicion_timeout: Duration,
    /// Number of helpers asked to probe indirectly (default: 3)
    pub indirect_probes: usize,
    /// How often to report to the aggregator (default: 5s)
    pub status_interval: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(2),
            suspicion_timeout: Duration::from_secs(3),
            indirect_probes: 3,
            status_interval: Duration::from_secs(5),
        }
    }
}

/// One in-flight probe round.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub seq: u64,
    /// Member being probed
    pub target: NodeAddress,
    /// Armed when the probe is sent; cleared once it fires
    pub ack_timer: Option<TimerId>,
    /// Armed when the round escalates to indirect probing
    pub suspicion_timer: Option<TimerId>,
    /// Helpers asked to probe the target
    pub helpers: Vec<NodeId>,
    /// Set when we are a helper: who asked, and their round number
    pub relay_for: Option<(NodeAddress, u64)>,
}

/// Failure detector state for one node.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    aggregator: Option<Endpoint>,
    probe_timer: Option<TimerId>,
    status_timer: Option<TimerId>,
    /// Last member picked by round-robin selection
    last_probed: Option<NodeId>,
    next_seq: u64,
    rounds: HashMap<u64, ProbeContext>,
    received_pings: u64,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig, aggregator: Option<Endpoint>) -> Self {
        Self {
            config,
            aggregator,
            probe_timer: None,
            status_timer: None,
            last_probed: None,
            next_seq: 1,
            rounds: HashMap::new(),
            received_pings: 0,
        }
    }

    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    /// Pings and indirect pings answered so far.
    pub fn received_pings(&self) -> u64 {
        self.received_pings
    }

    pub fn is_probing(&self) -> bool {
        self.probe_timer.is_some()
    }

    /// In-flight round by sequence number.
    pub fn round(&self, seq: u64) -> Option<&ProbeContext> {
        self.rounds.get(&seq)
    }

    pub fn rounds(&self) -> impl Iterator<Item = &ProbeContext> {
        self.rounds.values()
    }

    /// Arm the periodic timers.
    pub fn start(&mut self, ctx: &mut Context<'_>) {
        self.ensure_probing(ctx);
        if self.aggregator.is_some() && self.status_timer.is_none() {
            self.status_timer =
                Some(ctx.timers.schedule(TimerPurpose::StatusTick, self.config.status_interval, true));
        }
    }

    /// Forget all rounds. The caller cancels the timers.
    pub fn stop(&mut self) {
        self.probe_timer = None;
        self.status_timer = None;
        self.rounds.clear();
    }

    /// Arm the probe timer if it is not running and there is someone to probe.
    ///
    /// A node with no peers does not probe.
    pub fn ensure_probing(&mut self, ctx: &mut Context<'_>) {
        if self.probe_timer.is_some() || ctx.table.probe_candidates().is_empty() {
            return;
        }
        debug!("{} probing started", ctx.table.local_id());
        self.probe_timer =
            Some(ctx.timers.schedule(TimerPurpose::ProbeTick, self.config.probe_interval, true));
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    // ==================== Timers ====================

    /// Start a direct probe round against the next member in round-robin order.
    pub fn on_probe_tick(&mut self, ctx: &mut Context<'_>) {
        let candidates = ctx.table.probe_candidates();
        if candidates.is_empty() {
            if let Some(timer) = self.probe_timer.take() {
                ctx.timers.cancel(timer);
                debug!("{} probing paused: no members", ctx.table.local_id());
            }
            return;
        }

        let Some(target) = self.select_target(&candidates) else {
            debug!("{} all members have a probe outstanding", ctx.table.local_id());
            return;
        };
        let Some(address) = ctx.table.get(&target).map(|r| r.address.clone()) else {
            return;
        };
        self.last_probed = Some(target);

        let seq = self.next_seq();
        let ack_timer = ctx
            .timers
            .schedule(TimerPurpose::AckWait { seq }, self.config.ack_timeout, false);
        self.rounds.insert(
            seq,
            ProbeContext {
                seq,
                target: address.clone(),
                ack_timer: Some(ack_timer),
                suspicion_timer: None,
                helpers: Vec::new(),
                relay_for: None,
            },
        );

        debug!("{} ping {} seq {}", ctx.table.local_id(), target, seq);
        let piggyback = ctx.table.build_piggyback();
        ctx.send(&address, Payload::Swim(SwimMessage::Ping { seq, piggyback }));
    }

    /// Round-robin: the smallest eligible id after the last one probed,
    /// wrapping around. Members with a round in flight are skipped.
    fn select_target(&self, candidates: &[NodeId]) -> Option<NodeId> {
        let eligible: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|id| !self.rounds.values().any(|r| r.target.id() == *id))
            .collect();
        let after_cursor = self
            .last_probed
            .and_then(|last| eligible.iter().copied().find(|id| *id > last));
        after_cursor.or_else(|| eligible.first().copied())
    }

    /// No ack in time: suspect the target and escalate to indirect probing.
    pub fn on_ack_timeout(&mut self, seq: u64, ctx: &mut Context<'_>) {
        let local = ctx.table.local_id();
        let Some(round) = self.rounds.get_mut(&seq) else {
            return;
        };
        round.ack_timer = None;
        let target = round.target.id();

        match ctx.table.status(&target) {
            None | Some(MemberStatus::Failed) => {
                debug!("{} dropping round {} for {}: already failed", local, seq, target);
                self.rounds.remove(&seq);
                return;
            }
            Some(_) => {}
        }

        if ctx.table.mark_suspected(target) {
            info!("{} suspects {}", local, target);
        }

        // Helpers do not escalate; the originator's suspicion timer decides
        if round.relay_for.is_some() {
            self.rounds.remove(&seq);
            return;
        }

        let mut helpers: Vec<NodeId> = ctx
            .table
            .probe_candidates()
            .into_iter()
            .filter(|id| *id != target)
            .collect();
        helpers.shuffle(&mut *ctx.rng);
        helpers.truncate(self.config.indirect_probes);

        let target_address = round.target.clone();
        for helper in &helpers {
            let Some(address) = ctx.table.get(helper).map(|r| r.address.clone()) else {
                continue;
            };
            debug!("{} ping-req {} via {} seq {}", local, target, helper, seq);
            let piggyback = ctx.table.build_piggyback();
            ctx.send(
                &address,
                Payload::Swim(SwimMessage::PingReq {
                    seq,
                    piggyback,
                    target: target_address.clone(),
                }),
            );
        }

        round.helpers = helpers;
        round.suspicion_timer = Some(ctx.timers.schedule(
            TimerPurpose::SuspicionWait { seq },
            self.config.suspicion_timeout,
            false,
        ));
    }

    /// Indirect probing did not succeed in time: the target has failed.
    pub fn on_suspicion_timeout(&mut self, seq: u64, ctx: &mut Context<'_>) {
        let Some(round) = self.rounds.remove(&seq) else {
            return;
        };
        if let Some(timer) = round.ack_timer {
            ctx.timers.cancel(timer);
        }
        let target = round.target.id();
        if ctx.table.mark_failed(target) {
            info!("{} declares {} failed", ctx.table.local_id(), target);
        }
    }

    /// Send our counts to the aggregator.
    pub fn on_status_tick(&mut self, ctx: &mut Context<'_>) {
        let Some(aggregator) = self.aggregator else {
            return;
        };
        let report = StatusReport::capture(ctx.table, self.received_pings);
        debug!(
            "{} status: {} alive, {} suspected, {} failed, {} pings",
            ctx.table.local_id(),
            report.alive,
            report.suspected,
            report.failed,
            report.received_pings
        );
        ctx.send_direct(aggregator, Payload::Status(report));
    }

    // ==================== Messages ====================

    /// Handle a SWIM message from `from`.
    ///
    /// The caller has already applied the direct-contact rule for `from`.
    pub fn handle_message(&mut self, from: &NodeAddress, msg: SwimMessage, ctx: &mut Context<'_>) {
        let local = ctx.table.local_id();
        for change in ctx.table.merge_piggyback(msg.piggyback()) {
            log_change(local, &change);
        }
        self.ensure_probing(ctx);

        match msg {
            SwimMessage::Ping { seq, .. } => {
                self.received_pings += 1;
                debug!("{} pong {} seq {}", local, from.id(), seq);
                let piggyback = ctx.table.build_piggyback();
                ctx.send(from, Payload::Swim(SwimMessage::Pong { seq, piggyback }));
            }
            SwimMessage::Pong { seq, .. } => {
                let answers_round = self
                    .rounds
                    .get(&seq)
                    .is_some_and(|r| r.target.id() == from.id());
                if answers_round {
                    self.resolve(seq, ctx);
                } else {
                    debug!("{} stale pong from {} seq {}", local, from.id(), seq);
                }
            }
            SwimMessage::PingReq { seq, target, .. } => {
                self.start_indirect(from, seq, target, ctx);
            }
            SwimMessage::IndirectPing {
                seq,
                originator,
                original_seq,
                ..
            } => {
                self.received_pings += 1;
                debug!(
                    "{} indirect pong to {} for {}",
                    local,
                    from.id(),
                    originator.id()
                );
                let piggyback = ctx.table.build_piggyback();
                ctx.send(
                    from,
                    Payload::Swim(SwimMessage::IndirectPong {
                        seq,
                        piggyback,
                        originator,
                        original_seq,
                    }),
                );
            }
            SwimMessage::IndirectPong { seq, .. } => {
                // Only our own helper round, answered by its target
                let answers_round = self
                    .rounds
                    .get(&seq)
                    .is_some_and(|r| r.relay_for.is_some() && r.target.id() == from.id());
                if answers_round {
                    self.resolve(seq, ctx);
                } else {
                    debug!("{} stale indirect pong from {} seq {}", local, from.id(), seq);
                }
            }
            SwimMessage::FinalPong { seq, .. } => {
                if self.rounds.contains_key(&seq) {
                    self.resolve(seq, ctx);
                } else {
                    debug!("{} late final pong from {} seq {}", local, from.id(), seq);
                }
            }
        }
    }

    /// Helper side of a PingReq: probe `target` for `originator`.
    fn start_indirect(
        &mut self,
        originator: &NodeAddress,
        original_seq: u64,
        target: NodeAddress,
        ctx: &mut Context<'_>,
    ) {
        let seq = self.next_seq();
        let ack_timer = ctx
            .timers
            .schedule(TimerPurpose::AckWait { seq }, self.config.ack_timeout, false);
        self.rounds.insert(
            seq,
            ProbeContext {
                seq,
                target: target.clone(),
                ack_timer: Some(ack_timer),
                suspicion_timer: None,
                helpers: Vec::new(),
                relay_for: Some((originator.clone(), original_seq)),
            },
        );

        debug!(
            "{} indirect ping {} for {} seq {}",
            ctx.table.local_id(),
            target.id(),
            originator.id(),
            seq
        );
        let piggyback = ctx.table.build_piggyback();
        ctx.send(
            &target,
            Payload::Swim(SwimMessage::IndirectPing {
                seq,
                piggyback,
                originator: originator.clone(),
                original_seq,
            }),
        );
    }

    /// The target answered: close the round and clear any suspicion.
    fn resolve(&mut self, seq: u64, ctx: &mut Context<'_>) {
        let Some(round) = self.rounds.remove(&seq) else {
            return;
        };
        cancel_round_timers(&round, ctx);

        let target = round.target.id();
        if ctx.table.mark_alive(target) {
            info!("{} cleared suspicion of {}", ctx.table.local_id(), target);
        }

        // We were helping: pass the good news on
        if let Some((originator, original_seq)) = round.relay_for {
            let piggyback = ctx.table.build_piggyback();
            ctx.send(
                &originator,
                Payload::Swim(SwimMessage::FinalPong {
                    seq: original_seq,
                    piggyback,
                }),
            );
        }
    }
}

fn cancel_round_timers(round: &ProbeContext, ctx: &mut Context<'_>) {
    for timer in [round.ack_timer, round.suspicion_timer].into_iter().flatten() {
        ctx.timers.cancel(timer);
    }
}

fn log_change(local: NodeId, change: &MergeChange) {
    match change {
        MergeChange::Refuted {
            claimed,
            incarnation,
        } => {
            info!("{} refuted {:?} claim, incarnation now {}", local, claimed, incarnation);
        }
        MergeChange::Status { id, from, to } => match to {
            MemberStatus::Suspected | MemberStatus::Failed => {
                info!("{} learned {} is {:?} (was {:?})", local, id, to, from);
            }
            _ => debug!("{} learned {} is {:?} (was {:?})", local, id, to, from),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swim::{GossipConfig, MembershipTable, Piggyback};
    use crate::context::Outgoing;
    use crate::timer::{TimerOp, TimerRegistry};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::SocketAddr;

    fn addr(id: u32) -> NodeAddress {
        NodeAddress::open(Endpoint::new(
            NodeId::new(id),
            SocketAddr::from(([127, 0, 0, 1], 7000 + id as u16)),
        ))
    }

    /// Node 1 with the given peers, and everything a handler needs.
    struct Harness {
        detector: FailureDetector,
        table: MembershipTable,
        timers: TimerRegistry,
        outbox: Vec<Outgoing>,
        rng: StdRng,
    }

    impl Harness {
        fn new(peers: &[u32]) -> Self {
            let mut table = MembershipTable::new(addr(1), GossipConfig::default());
            for id in peers {
                table.add_bootstrap(addr(*id));
            }
            Self {
                detector: FailureDetector::new(FailureDetectorConfig::default(), None),
                table,
                timers: TimerRegistry::new(),
                outbox: Vec::new(),
                rng: StdRng::seed_from_u64(7),
            }
        }

        fn run<R>(&mut self, f: impl FnOnce(&mut FailureDetector, &mut Context<'_>) -> R) -> R {
            let mut ctx = Context {
                table: &mut self.table,
                timers: &mut self.timers,
                outbox: &mut self.outbox,
                rng: &mut self.rng,
            };
            f(&mut self.detector, &mut ctx)
        }

        fn deliver(&mut self, from: u32, msg: SwimMessage) {
            self.run(|d, ctx| d.handle_message(&addr(from), msg, ctx));
        }

        fn take_sent(&mut self) -> Vec<(NodeId, SwimMessage)> {
            self.outbox
                .drain(..)
                .filter_map(|out| match out {
                    Outgoing::Routed {
                        to,
                        payload: Payload::Swim(msg),
                    } => Some((to.id(), msg)),
                    _ => None,
                })
                .collect()
        }

        fn status(&self, id: u32) -> Option<MemberStatus> {
            self.table.status(&NodeId::new(id))
        }

        /// Run one probe tick and return the round's seq and target.
        fn probe(&mut self) -> (u64, NodeId) {
            self.run(|d, ctx| d.on_probe_tick(ctx));
            let sent = self.take_sent();
            assert_eq!(sent.len(), 1);
            match &sent[0] {
                (to, SwimMessage::Ping { seq, .. }) => (*seq, *to),
                other => panic!("expected ping, got {:?}", other),
            }
        }

        fn ack_timer(&self, seq: u64) -> TimerId {
            self.detector.round(seq).unwrap().ack_timer.unwrap()
        }
    }

    fn pong(seq: u64) -> SwimMessage {
        SwimMessage::Pong {
            seq,
            piggyback: Piggyback::new(),
        }
    }

    // ==================== Scheduling ====================

    #[test]
    fn test_no_probe_timer_without_peers() {
        let mut h = Harness::new(&[]);
        h.run(|d, ctx| d.start(ctx));
        assert!(!h.detector.is_probing());
        assert!(h.timers.is_empty());
    }

    #[test]
    fn test_first_peer_arms_one_probe_timer() {
        let mut h = Harness::new(&[]);
        h.run(|d, ctx| d.start(ctx));

        h.table.check_source(&addr(2));
        h.run(|d, ctx| d.ensure_probing(ctx));
        h.table.check_source(&addr(3));
        h.run(|d, ctx| d.ensure_probing(ctx));

        assert_eq!(h.timers.count_where(|p| *p == TimerPurpose::ProbeTick), 1);
    }

    #[test]
    fn test_status_timer_only_with_aggregator() {
        let mut h = Harness::new(&[2]);
        h.detector = FailureDetector::new(
            FailureDetectorConfig::default(),
            Some(addr(9).endpoint),
        );
        h.run(|d, ctx| d.start(ctx));
        assert_eq!(h.timers.count_where(|p| *p == TimerPurpose::StatusTick), 1);

        h.run(|d, ctx| d.on_status_tick(ctx));
        assert!(matches!(
            h.outbox.as_slice(),
            [Outgoing::Direct {
                payload: Payload::Status(StatusReport { alive: 2, .. }),
                ..
            }]
        ));
    }

    #[test]
    fn test_probe_timer_cancelled_when_no_candidates() {
        let mut h = Harness::new(&[2]);
        h.run(|d, ctx| d.start(ctx));
        h.table.mark_failed(NodeId::new(2));
        h.timers.drain_ops();

        h.run(|d, ctx| d.on_probe_tick(ctx));

        assert!(!h.detector.is_probing());
        assert!(matches!(h.timers.drain_ops().as_slice(), [TimerOp::Cancel { .. }]));
        assert!(h.take_sent().is_empty());
    }

    // ==================== Round robin ====================

    #[test]
    fn test_round_robin_visits_each_member_once_per_cycle() {
        let mut h = Harness::new(&[4, 2, 3]);
        let mut visited = Vec::new();
        for _ in 0..6 {
            let (seq, target) = h.probe();
            visited.push(target.as_u32());
            h.deliver(target.as_u32(), pong(seq));
        }
        assert_eq!(visited, vec![2, 3, 4, 2, 3, 4]);
    }

    #[test]
    fn test_round_robin_skips_outstanding_target() {
        let mut h = Harness::new(&[2, 3]);
        let (_, first) = h.probe();
        let (_, second) = h.probe();
        assert_eq!(first, NodeId::new(2));
        assert_eq!(second, NodeId::new(3));

        // Both have probes in flight: nothing to do this tick
        h.run(|d, ctx| d.on_probe_tick(ctx));
        assert!(h.take_sent().is_empty());
    }

    #[test]
    fn test_round_robin_never_selects_self() {
        let mut h = Harness::new(&[2]);
        for _ in 0..3 {
            let (seq, target) = h.probe();
            assert_eq!(target, NodeId::new(2));
            h.deliver(2, pong(seq));
        }
    }

    // ==================== Direct probe ====================

    #[test]
    fn test_pong_resolves_round() {
        let mut h = Harness::new(&[2]);
        let (seq, _) = h.probe();
        let timer = h.ack_timer(seq);

        h.deliver(2, pong(seq));

        assert!(h.detector.round(seq).is_none());
        assert!(!h.timers.is_live(timer));
    }

    #[test]
    fn test_pong_from_wrong_member_ignored() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.deliver(3, pong(seq));
        assert!(h.detector.round(seq).is_some());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut h = Harness::new(&[2]);
        h.deliver(
            2,
            SwimMessage::Ping {
                seq: 40,
                piggyback: Piggyback::new(),
            },
        );
        let sent = h.take_sent();
        assert!(matches!(sent.as_slice(), [(to, SwimMessage::Pong { seq: 40, .. })] if *to == NodeId::new(2)));
        assert_eq!(h.detector.received_pings(), 1);
    }

    // ==================== Indirect probe ====================

    #[test]
    fn test_ack_timeout_suspects_and_asks_k_helpers() {
        let mut h = Harness::new(&[2, 3, 4, 5, 6]);
        let (seq, target) = h.probe();
        assert_eq!(target, NodeId::new(2));
        let timer = h.ack_timer(seq);
        h.timers.fire(timer);

        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));

        assert_eq!(h.status(2), Some(MemberStatus::Suspected));
        let sent = h.take_sent();
        assert_eq!(sent.len(), 3);
        let mut helpers: Vec<_> = sent
            .iter()
            .map(|(to, msg)| {
                assert!(matches!(msg, SwimMessage::PingReq { seq: s, target, .. } if *s == seq && target.id() == NodeId::new(2)));
                *to
            })
            .collect();
        helpers.sort();
        helpers.dedup();
        assert_eq!(helpers.len(), 3);
        assert!(!helpers.contains(&NodeId::new(2)));
        assert!(!helpers.contains(&NodeId::new(1)));
        assert!(h.detector.round(seq).unwrap().suspicion_timer.is_some());
    }

    #[test]
    fn test_ack_timeout_with_few_helpers() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));
        let sent = h.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NodeId::new(3));
    }

    #[test]
    fn test_final_pong_clears_suspicion() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));
        let suspicion = h.detector.round(seq).unwrap().suspicion_timer.unwrap();
        h.take_sent();

        h.deliver(
            3,
            SwimMessage::FinalPong {
                seq,
                piggyback: Piggyback::new(),
            },
        );

        assert_eq!(h.status(2), Some(MemberStatus::Alive));
        assert_eq!(h.table.get(&NodeId::new(2)).unwrap().incarnation, 1);
        assert!(!h.timers.is_live(suspicion));
        assert!(h.detector.round(seq).is_none());

        // The suspicion timer firing late changes nothing
        h.run(|d, ctx| d.on_suspicion_timeout(seq, ctx));
        assert_eq!(h.status(2), Some(MemberStatus::Alive));
    }

    #[test]
    fn test_suspicion_timeout_fails_target_once() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));
        h.take_sent();

        h.run(|d, ctx| d.on_suspicion_timeout(seq, ctx));
        assert_eq!(h.status(2), Some(MemberStatus::Failed));
        assert!(h.detector.round(seq).is_none());
        assert!(h.take_sent().is_empty());

        h.run(|d, ctx| d.on_suspicion_timeout(seq, ctx));
        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));
        assert!(h.take_sent().is_empty());
        assert_eq!(h.table.failed_count(), 1);
    }

    #[test]
    fn test_ack_timeout_for_failed_target_drops_round() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.table.mark_failed(NodeId::new(2));

        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));

        assert!(h.detector.round(seq).is_none());
        assert!(h.take_sent().is_empty());
    }

    // ==================== Helper role ====================

    #[test]
    fn test_ping_req_sends_indirect_ping() {
        let mut h = Harness::new(&[2, 3]);
        h.deliver(
            3,
            SwimMessage::PingReq {
                seq: 12,
                piggyback: Piggyback::new(),
                target: addr(2),
            },
        );

        let sent = h.take_sent();
        let [(to, SwimMessage::IndirectPing { seq, originator, original_seq, .. })] = sent.as_slice() else {
            panic!("expected one indirect ping, got {:?}", sent);
        };
        assert_eq!(*to, NodeId::new(2));
        assert_eq!(originator.id(), NodeId::new(3));
        assert_eq!(*original_seq, 12);
        assert!(h.detector.round(*seq).unwrap().relay_for.is_some());
    }

    #[test]
    fn test_indirect_ping_answered_to_helper() {
        let mut h = Harness::new(&[2, 3]);
        h.deliver(
            3,
            SwimMessage::IndirectPing {
                seq: 5,
                piggyback: Piggyback::new(),
                originator: addr(2),
                original_seq: 8,
            },
        );

        let sent = h.take_sent();
        assert!(matches!(
            sent.as_slice(),
            [(to, SwimMessage::IndirectPong { seq: 5, original_seq: 8, .. })] if *to == NodeId::new(3)
        ));
        assert_eq!(h.detector.received_pings(), 1);
    }

    #[test]
    fn test_indirect_pong_forwards_final_pong() {
        let mut h = Harness::new(&[2, 3]);
        h.deliver(
            3,
            SwimMessage::PingReq {
                seq: 12,
                piggyback: Piggyback::new(),
                target: addr(2),
            },
        );
        let helper_seq = match h.take_sent().as_slice() {
            [(_, SwimMessage::IndirectPing { seq, .. })] => *seq,
            other => panic!("unexpected {:?}", other),
        };
        let timer = h.ack_timer(helper_seq);

        h.deliver(
            2,
            SwimMessage::IndirectPong {
                seq: helper_seq,
                piggyback: Piggyback::new(),
                originator: addr(3),
                original_seq: 12,
            },
        );

        let sent = h.take_sent();
        assert!(matches!(
            sent.as_slice(),
            [(to, SwimMessage::FinalPong { seq: 12, .. })] if *to == NodeId::new(3)
        ));
        assert!(!h.timers.is_live(timer));
        assert!(h.detector.round(helper_seq).is_none());
    }

    #[test]
    fn test_final_pong_goes_to_recorded_originator() {
        let mut h = Harness::new(&[2, 3, 4]);
        h.deliver(
            3,
            SwimMessage::PingReq {
                seq: 12,
                piggyback: Piggyback::new(),
                target: addr(2),
            },
        );
        let helper_seq = match h.take_sent().as_slice() {
            [(_, SwimMessage::IndirectPing { seq, .. })] => *seq,
            other => panic!("unexpected {:?}", other),
        };

        // The reply names someone else; the round knows who asked
        h.deliver(
            2,
            SwimMessage::IndirectPong {
                seq: helper_seq,
                piggyback: Piggyback::new(),
                originator: addr(4),
                original_seq: 99,
            },
        );

        let sent = h.take_sent();
        assert!(matches!(
            sent.as_slice(),
            [(to, SwimMessage::FinalPong { seq: 12, .. })] if *to == NodeId::new(3)
        ));
    }

    #[test]
    fn test_unmatched_indirect_pong_ignored() {
        let mut h = Harness::new(&[2, 3, 4]);
        let indirect_pong = |seq| SwimMessage::IndirectPong {
            seq,
            piggyback: Piggyback::new(),
            originator: addr(3),
            original_seq: 12,
        };

        // No round at all
        h.deliver(2, indirect_pong(77));
        assert!(h.take_sent().is_empty());

        // Our own direct round is not a helper round
        let (seq, target) = h.probe();
        h.deliver(target.as_u32(), indirect_pong(seq));
        assert!(h.take_sent().is_empty());
        assert!(h.detector.round(seq).is_some());

        // A helper round answered by someone other than its target
        h.deliver(
            3,
            SwimMessage::PingReq {
                seq: 12,
                piggyback: Piggyback::new(),
                target: addr(2),
            },
        );
        let helper_seq = match h.take_sent().as_slice() {
            [(_, SwimMessage::IndirectPing { seq, .. })] => *seq,
            other => panic!("unexpected {:?}", other),
        };
        h.deliver(4, indirect_pong(helper_seq));
        assert!(h.take_sent().is_empty());
        assert!(h.detector.round(helper_seq).is_some());
    }

    #[test]
    fn test_helper_timeout_suspects_without_escalating() {
        let mut h = Harness::new(&[2, 3, 4]);
        h.deliver(
            3,
            SwimMessage::PingReq {
                seq: 12,
                piggyback: Piggyback::new(),
                target: addr(2),
            },
        );
        let helper_seq = match h.take_sent().as_slice() {
            [(_, SwimMessage::IndirectPing { seq, .. })] => *seq,
            other => panic!("unexpected {:?}", other),
        };

        h.run(|d, ctx| d.on_ack_timeout(helper_seq, ctx));

        assert_eq!(h.status(2), Some(MemberStatus::Suspected));
        assert!(h.take_sent().is_empty());
        assert!(h.detector.round(helper_seq).is_none());
        assert_eq!(h.timers.count_where(|p| matches!(p, TimerPurpose::SuspicionWait { .. })), 0);
    }

    // ==================== Gossip ====================

    #[test]
    fn test_every_probe_message_carries_piggyback() {
        let mut h = Harness::new(&[2, 3]);
        let (seq, _) = h.probe();
        h.run(|d, ctx| d.on_ack_timeout(seq, ctx));
        for (_, msg) in h.take_sent() {
            assert!(msg.piggyback().contains_key(&NodeId::new(2)));
        }
    }

    #[test]
    fn test_gossip_discovery_starts_probing() {
        let mut h = Harness::new(&[]);
        h.run(|d, ctx| d.start(ctx));

        let mut piggyback = Piggyback::new();
        piggyback.insert(
            NodeId::new(4),
            crate::swim::PiggybackEntry {
                address: addr(4),
                status: MemberStatus::Alive,
                incarnation: 0,
                remaining_budget: 2,
            },
        );
        // Message from an unknown sender not yet in the table
        h.run(|d, ctx| {
            d.handle_message(&addr(5), SwimMessage::FinalPong { seq: 99, piggyback }, ctx)
        });

        assert!(h.detector.is_probing());
        assert!(h.table.contains(&NodeId::new(4)));
    }
}
