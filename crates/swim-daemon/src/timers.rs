//! Timer service backing the node's timer effects.
//!
//! Every scheduled timer is a tokio task that sends its [`TimerId`] into the
//! runtime's channel when it fires. Cancelling aborts the task. A firing that
//! races with a cancel can still reach the runtime; the node's registry
//! ignores it.

use std::collections::HashMap;
use std::time::Duration;
use swim_core::{TimerId, TimerOp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

struct Scheduled {
    task: JoinHandle<()>,
    periodic: bool,
}

pub struct TimerService {
    tasks: HashMap<TimerId, Scheduled>,
    fired_tx: mpsc::UnboundedSender<TimerId>,
}

impl TimerService {
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerId>) -> Self {
        Self {
            tasks: HashMap::new(),
            fired_tx,
        }
    }

    pub fn apply(&mut self, op: TimerOp) {
        match op {
            TimerOp::Schedule {
                timer,
                delay,
                periodic,
            } => self.schedule(timer, delay, periodic),
            TimerOp::Cancel { timer } => self.cancel(timer),
        }
    }

    fn schedule(&mut self, timer: TimerId, delay: Duration, periodic: bool) {
        // tokio intervals reject a zero period
        let delay = delay.max(Duration::from_millis(1));
        let tx = self.fired_tx.clone();

        let task = if periodic {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + delay, delay);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if tx.send(timer).is_err() {
                        break;
                    }
                }
            })
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(timer);
            })
        };

        trace!("Scheduled {} in {:?} (periodic: {})", timer, delay, periodic);
        if let Some(old) = self.tasks.insert(timer, Scheduled { task, periodic }) {
            old.task.abort();
        }
    }

    pub fn cancel(&mut self, timer: TimerId) {
        if let Some(scheduled) = self.tasks.remove(&timer) {
            scheduled.task.abort();
            trace!("Cancelled {}", timer);
        }
    }

    /// Forget a one-shot timer that has fired. Periodic timers stay.
    pub fn fired(&mut self, timer: TimerId) {
        if self.tasks.get(&timer).is_some_and(|s| !s.periodic) {
            self.tasks.remove(&timer);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, scheduled) in self.tasks.drain() {
            scheduled.task.abort();
        }
    }

    /// Number of timers still pending (one-shots) or running (periodic).
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swim_core::timer::{TimerPurpose, TimerRegistry};

    fn service() -> (TimerService, mpsc::UnboundedReceiver<TimerId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerService::new(tx), rx)
    }

    /// Real ids come from a registry.
    fn ids(n: usize) -> Vec<TimerId> {
        let mut registry = TimerRegistry::new();
        (0..n)
            .map(|_| registry.schedule(TimerPurpose::ProbeTick, Duration::from_secs(1), false))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (mut timers, mut rx) = service();
        let id = ids(1)[0];

        timers.apply(TimerOp::Schedule {
            timer: id,
            delay: Duration::from_millis(100),
            periodic: false,
        });

        assert_eq!(rx.recv().await, Some(id));
        timers.fired(id);
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_keeps_firing() {
        let (mut timers, mut rx) = service();
        let id = ids(1)[0];

        timers.apply(TimerOp::Schedule {
            timer: id,
            delay: Duration::from_millis(100),
            periodic: true,
        });

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(id));
            timers.fired(id);
        }
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (mut timers, mut rx) = service();
        let ids = ids(2);

        for &id in &ids {
            timers.apply(TimerOp::Schedule {
                timer: id,
                delay: Duration::from_millis(100),
                periodic: false,
            });
        }
        timers.apply(TimerOp::Cancel { timer: ids[0] });

        assert_eq!(rx.recv().await, Some(ids[1]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_everything() {
        let (mut timers, mut rx) = service();

        for id in ids(3) {
            timers.apply(TimerOp::Schedule {
                timer: id,
                delay: Duration::from_millis(50),
                periodic: true,
            });
        }
        timers.cancel_all();
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
