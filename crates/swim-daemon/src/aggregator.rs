//! Status aggregator.
//!
//! Collects the periodic status reports nodes send and watches for
//! convergence: every node with a recent report agreeing on the same
//! `(alive, suspected, failed)` counts. Once any node reports a failure, the
//! time until the group next converges is measured and logged.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use swim_core::protocol::{Datagram, MAX_DATAGRAM_SIZE, Payload};
use swim_core::swim::StatusReport;
use swim_core::{DatagramTransport, NodeId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A `(alive, suspected, failed)` triple.
pub type View = (u32, u32, u32);

#[derive(Debug, Clone, Copy)]
struct Latest {
    report: StatusReport,
    at: Instant,
}

/// Emitted when the reporting nodes come to agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub view: View,
    pub nodes: usize,
    /// Time since the first failure report, for the first convergence after it
    pub after_failure: Option<Duration>,
}

#[derive(Debug)]
pub struct Aggregator {
    latest: BTreeMap<NodeId, Latest>,
    staleness: Duration,
    received: u64,
    converged: Option<View>,
    first_failure_at: Option<Instant>,
    convergence_after_failure: Option<Duration>,
}

impl Aggregator {
    pub fn new(staleness: Duration) -> Self {
        Self {
            latest: BTreeMap::new(),
            staleness,
            received: 0,
            converged: None,
            first_failure_at: None,
            convergence_after_failure: None,
        }
    }

    /// Take in one report. Returns the convergence it completes, if any.
    pub fn record(&mut self, from: NodeId, report: StatusReport, now: Instant) -> Option<Convergence> {
        self.received += 1;
        self.latest.insert(from, Latest { report, at: now });

        if report.failed > 0 && self.first_failure_at.is_none() {
            info!("First failure reported by {} at {:?}", from, report.view());
            self.first_failure_at = Some(now);
        }

        let Some(view) = self.agreed_view(now) else {
            self.converged = None;
            return None;
        };
        if self.converged == Some(view) {
            return None;
        }
        self.converged = Some(view);

        let after_failure = match (self.first_failure_at, self.convergence_after_failure) {
            (Some(failed_at), None) => {
                let elapsed = now.duration_since(failed_at);
                self.convergence_after_failure = Some(elapsed);
                Some(elapsed)
            }
            _ => None,
        };

        let convergence = Convergence {
            view,
            nodes: self.fresh(now).count(),
            after_failure,
        };
        match convergence.after_failure {
            Some(elapsed) => info!(
                "Converged on {:?} across {} nodes, {:?} after the first failure",
                view, convergence.nodes, elapsed
            ),
            None => info!("Converged on {:?} across {} nodes", view, convergence.nodes),
        }
        Some(convergence)
    }

    fn fresh(&self, now: Instant) -> impl Iterator<Item = (&NodeId, &Latest)> {
        self.latest
            .iter()
            .filter(move |(_, latest)| now.duration_since(latest.at) <= self.staleness)
    }

    /// The view all fresh reports share, if they share one.
    fn agreed_view(&self, now: Instant) -> Option<View> {
        let mut views = self.fresh(now).map(|(_, latest)| latest.report.view());
        let first = views.next()?;
        views.all(|view| view == first).then_some(first)
    }

    pub fn is_converged(&self) -> bool {
        self.converged.is_some()
    }

    pub fn convergence_after_failure(&self) -> Option<Duration> {
        self.convergence_after_failure
    }

    pub fn latest(&self, id: NodeId) -> Option<StatusReport> {
        self.latest.get(&id).map(|latest| latest.report)
    }

    pub fn summary(&self, now: Instant) -> Summary {
        Summary {
            reports: self.received,
            nodes: self.latest.len(),
            converged: self.converged,
            convergence_after_failure_ms: self
                .convergence_after_failure
                .map(millis),
            members: self
                .latest
                .iter()
                .map(|(id, latest)| ReporterStatus {
                    id: *id,
                    received_pings: latest.report.received_pings,
                    alive: latest.report.alive,
                    suspected: latest.report.suspected,
                    failed: latest.report.failed,
                    age_ms: millis(now.duration_since(latest.at)),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub reports: u64,
    pub nodes: usize,
    pub converged: Option<View>,
    pub convergence_after_failure_ms: Option<u64>,
    pub members: Vec<ReporterStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReporterStatus {
    pub id: NodeId,
    pub received_pings: u64,
    pub alive: u32,
    pub suspected: u32,
    pub failed: u32,
    pub age_ms: u64,
}

/// Receive reports until `shutdown` fires, logging a summary every
/// `summary_interval`. Returns the final state.
pub async fn serve(
    transport: Arc<dyn DatagramTransport>,
    mut aggregator: Aggregator,
    summary_interval: Duration,
    json: bool,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<Aggregator> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut ticker = tokio::time::interval(summary_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = transport.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Aggregator receive failed: {}", e);
                        continue;
                    }
                };
                match Datagram::from_bytes(&buf[..len]) {
                    Ok(Datagram { header, payload: Payload::Status(report), .. }) => {
                        let reporter = header.inner().source.id();
                        debug!("Status from {} ({}): {:?}", reporter, from, report);
                        aggregator.record(reporter, report, Instant::now());
                    }
                    Ok(other) => debug!("Ignoring {} from {}", other.payload.kind(), from),
                    Err(e) => warn!("Dropping undecodable datagram from {}: {}", from, e),
                }
            }
            _ = ticker.tick() => log_summary(&aggregator.summary(Instant::now()), json),
            _ = &mut shutdown => {
                info!("Aggregator shutting down after {} reports", aggregator.received);
                return Ok(aggregator);
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_summary(summary: &Summary, json: bool) {
    if json {
        match serde_json::to_string(summary) {
            Ok(line) => info!("{}", line),
            Err(e) => warn!("Failed to render summary: {}", e),
        }
        return;
    }
    info!(
        "{} nodes, {} reports, converged: {}",
        summary.nodes,
        summary.reports,
        summary
            .converged
            .map_or_else(|| "no".to_string(), |view| format!("{view:?}"))
    );
    if let Some(ms) = summary.convergence_after_failure_ms {
        info!("Convergence after failure: {}ms", ms);
    }
}
