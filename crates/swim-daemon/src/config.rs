//! Command-line configuration for the node and aggregator processes.

use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;
use swim_core::nat::{NatConfig, StaticSample};
use swim_core::swim::{FailureDetectorConfig, GossipConfig, IncarnationPolicy};
use swim_core::{Endpoint, NodeAddress, NodeConfig, NodeId};

/// Arguments of the `node` subcommand.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node ID (generated if not provided)
    #[arg(long)]
    pub id: Option<NodeId>,

    /// Address to bind the UDP socket to
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    pub listen: SocketAddr,

    /// Address announced to the group, if different from the bound one
    #[arg(long)]
    pub advertise: Option<SocketAddr>,

    /// Seed peer, as id@host:port (repeatable)
    #[arg(long = "seed", value_name = "ID@HOST:PORT")]
    pub seeds: Vec<Endpoint>,

    /// Where to send status reports, as id@host:port
    #[arg(long, value_name = "ID@HOST:PORT")]
    pub aggregator: Option<Endpoint>,

    /// Run as a NAT-ed node, reachable only through its parents
    #[arg(long)]
    pub nat: bool,

    /// Initial relay parent, as id@host:port (repeatable, requires --nat)
    #[arg(long = "parent", value_name = "ID@HOST:PORT")]
    pub parents: Vec<Endpoint>,

    /// Open peer offered as a replacement parent (repeatable)
    #[arg(long = "sample", value_name = "ID@HOST:PORT")]
    pub sample: Vec<Endpoint>,

    #[arg(long, default_value_t = 1000)]
    pub probe_interval_ms: u64,

    #[arg(long, default_value_t = 2000)]
    pub ack_timeout_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub suspicion_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub status_interval_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 2000)]
    pub pong_timeout_ms: u64,

    /// Helpers asked to probe a silent member
    #[arg(long, default_value_t = 3)]
    pub indirect_probes: usize,

    /// Most replacement parents requested at once
    #[arg(long, default_value_t = 2)]
    pub max_candidate_parents: usize,

    /// Constant C in the gossip budget round(C * log10(N))
    #[arg(long, default_value_t = 4.0)]
    pub dissemination_factor: f64,

    /// Expected group size, used for the gossip budget while few members are known
    #[arg(long)]
    pub group_size: Option<usize>,

    /// Require a strictly greater incarnation for SUSPECTED to override ALIVE
    #[arg(long)]
    pub strict_suspicion: bool,

    /// Fixed RNG seed for reproducible helper and parent selection
    #[arg(long)]
    pub seed_rng: Option<u64>,
}

impl NodeArgs {
    /// Assemble the node configuration. `bound` is the socket actually bound,
    /// which matters when listening on port 0.
    pub fn node_config(&self, bound: SocketAddr) -> Result<NodeConfig, ConfigError> {
        let socket = self.advertise.unwrap_or(bound);
        if socket.ip().is_unspecified() {
            return Err(ConfigError::UnspecifiedAddress(socket));
        }

        let id = self.id.unwrap_or_else(NodeId::generate);
        let endpoint = Endpoint::new(id, socket);

        let address = match (self.nat, self.parents.is_empty()) {
            (true, true) => return Err(ConfigError::NatWithoutParents),
            (true, false) => NodeAddress::nated(endpoint, self.parents.iter().copied()),
            (false, false) => return Err(ConfigError::ParentsWithoutNat),
            (false, true) => NodeAddress::open(endpoint),
        };

        if let Some(seed) = self.seeds.iter().find(|seed| seed.id == id) {
            return Err(ConfigError::SeedIsSelf(*seed));
        }

        let mut config = NodeConfig::new(address);
        config.bootstrap = self.seeds.iter().copied().map(NodeAddress::open).collect();
        config.aggregator = self.aggregator;
        config.failure = FailureDetectorConfig {
            probe_interval: millis(self.probe_interval_ms)?,
            ack_timeout: millis(self.ack_timeout_ms)?,
            suspicion_timeout: millis(self.suspicion_timeout_ms)?,
            indirect_probes: self.indirect_probes,
            status_interval: millis(self.status_interval_ms)?,
        };
        config.gossip = GossipConfig {
            dissemination_factor: self.dissemination_factor,
            group_size_hint: self.group_size,
            suspicion_policy: if self.strict_suspicion {
                IncarnationPolicy::StrictlyGreater
            } else {
                IncarnationPolicy::GreaterOrEqual
            },
        };
        config.nat = NatConfig {
            heartbeat_interval: millis(self.heartbeat_interval_ms)?,
            pong_timeout: millis(self.pong_timeout_ms)?,
            max_candidate_parents: self.max_candidate_parents,
        };
        config.rng_seed = self.seed_rng;
        Ok(config)
    }

    /// Peer sample handed to the NAT layer.
    pub fn sampler(&self) -> StaticSample {
        StaticSample(self.sample.clone())
    }
}

/// Arguments of the `aggregator` subcommand.
#[derive(Args, Debug, Clone)]
pub struct AggregatorArgs {
    /// Address to receive status reports on
    #[arg(short, long, default_value = "127.0.0.1:7100")]
    pub listen: SocketAddr,

    /// Reports older than this no longer count towards convergence
    #[arg(long, default_value_t = 15000)]
    pub staleness_ms: u64,

    /// How often to log a summary
    #[arg(long, default_value_t = 5000)]
    pub summary_interval_ms: u64,

    /// Log summaries as JSON
    #[arg(long)]
    pub json: bool,
}

impl AggregatorArgs {
    pub fn staleness(&self) -> Result<Duration, ConfigError> {
        millis(self.staleness_ms)
    }

    pub fn summary_interval(&self) -> Result<Duration, ConfigError> {
        millis(self.summary_interval_ms)
    }
}

fn millis(ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::ZeroDuration);
    }
    Ok(Duration::from_millis(ms))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot announce unspecified address {0}; pass --advertise")]
    UnspecifiedAddress(SocketAddr),
    #[error("--nat requires at least one --parent")]
    NatWithoutParents,
    #[error("--parent is only meaningful with --nat")]
    ParentsWithoutNat,
    #[error("Seed {0} has our own id")]
    SeedIsSelf(Endpoint),
    #[error("Intervals and timeouts must be at least 1ms")]
    ZeroDuration,
}
