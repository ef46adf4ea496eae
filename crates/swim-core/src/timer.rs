//! Timer bookkeeping.
//!
//! Components never sleep. They register a timer here, which records what the
//! timer is for and queues a [`TimerOp`] for the runtime to carry out. When the
//! runtime reports the timer as fired, [`TimerRegistry::fire`] hands back the
//! purpose, or `None` if the timer was already cancelled or resolved. That
//! lookup is the guard against late-firing timers: an id that is no longer
//! registered refers to a round that already finished through another path.

use crate::address::Endpoint;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Unique identifier of a scheduled timer.
///
/// Ids come from a per-node counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What a timer means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    /// Periodic: pick the next member to probe.
    ProbeTick,
    /// Periodic: send a status snapshot to the aggregator.
    StatusTick,
    /// One-shot: no ack for probe round `seq` yet.
    AckWait { seq: u64 },
    /// One-shot: indirect probing for round `seq` did not succeed in time.
    SuspicionWait { seq: u64 },
    /// Periodic: ping every relay parent.
    NatHeartbeat,
    /// One-shot: `parent` did not answer NatPing `seq` in time.
    ParentPongWait { parent: Endpoint, seq: u64 },
}

/// Instruction for the runtime's timer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOp {
    Schedule {
        timer: TimerId,
        delay: Duration,
        periodic: bool,
    },
    Cancel {
        timer: TimerId,
    },
}

#[derive(Debug, Clone)]
struct LiveTimer {
    purpose: TimerPurpose,
    periodic: bool,
}

/// Registry of live timers for one node.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    next_id: u64,
    live: HashMap<TimerId, LiveTimer>,
    pending_ops: Vec<TimerOp>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer and queue its scheduling.
    pub fn schedule(&mut self, purpose: TimerPurpose, delay: Duration, periodic: bool) -> TimerId {
        self.next_id += 1;
        let timer = TimerId(self.next_id);
        self.live.insert(timer, LiveTimer { purpose, periodic });
        self.pending_ops.push(TimerOp::Schedule {
            timer,
            delay,
            periodic,
        });
        timer
    }

    /// Unregister a timer and queue its cancellation.
    ///
    /// Returns the purpose if the timer was still live.
    pub fn cancel(&mut self, timer: TimerId) -> Option<TimerPurpose> {
        let live = self.live.remove(&timer)?;
        self.pending_ops.push(TimerOp::Cancel { timer });
        Some(live.purpose)
    }

    /// Resolve a fired timer.
    ///
    /// One-shot timers are unregistered; periodic ones stay live. Returns
    /// `None` for ids that are no longer registered.
    pub fn fire(&mut self, timer: TimerId) -> Option<TimerPurpose> {
        let live = self.live.get(&timer)?;
        let purpose = live.purpose;
        if !live.periodic {
            self.live.remove(&timer);
        }
        Some(purpose)
    }

    /// Cancel every live timer.
    pub fn cancel_all(&mut self) {
        let mut ids: Vec<_> = self.live.keys().copied().collect();
        ids.sort();
        for timer in ids {
            self.cancel(timer);
        }
    }

    pub fn is_live(&self, timer: TimerId) -> bool {
        self.live.contains_key(&timer)
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Count live timers matching a predicate on their purpose.
    pub fn count_where(&self, pred: impl Fn(&TimerPurpose) -> bool) -> usize {
        self.live.values().filter(|t| pred(&t.purpose)).count()
    }

    /// Take the queued schedule/cancel instructions.
    pub fn drain_ops(&mut self) -> Vec<TimerOp> {
        std::mem::take(&mut self.pending_ops)
    }
}
