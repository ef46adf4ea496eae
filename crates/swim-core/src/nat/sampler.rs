//! Peer-sampling collaborator.
//!
//! The relay layer pulls a sample of open peers from here whenever it needs
//! candidate parents. The sample is a best-effort cache: it may be stale or
//! empty, and the relay never waits on it.

use crate::address::Endpoint;

pub trait PeerSampler: Send {
    /// Current sample of open endpoints that could serve as relay parents.
    fn current_sample(&self) -> Vec<Endpoint>;
}

/// A fixed sample, e.g. from the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticSample(pub Vec<Endpoint>);

impl PeerSampler for StaticSample {
    fn current_sample(&self) -> Vec<Endpoint> {
        self.0.clone()
    }
}

impl<F> PeerSampler for F
where
    F: Fn() -> Vec<Endpoint> + Send,
{
    fn current_sample(&self) -> Vec<Endpoint> {
        self()
    }
}
