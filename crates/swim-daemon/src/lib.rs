//! swim-daemon library: the tokio runtime around swim-core.
//!
//! Exposes the runtime pieces so the binary and the end-to-end tests share
//! them.

pub mod aggregator;
pub mod config;
pub mod runtime;
pub mod timers;
pub mod transport;

// Re-export key types for convenience
pub use aggregator::{Aggregator, Convergence, Summary};
pub use config::{AggregatorArgs, ConfigError, NodeArgs};
pub use runtime::{NodeHandle, NodeRuntime};
pub use timers::TimerService;
pub use transport::UdpTransport;
