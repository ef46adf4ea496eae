//! Shared state handed to protocol handlers.
//!
//! Handlers never send anything themselves. They queue [`Outgoing`] messages
//! and register timers; the node turns both into effects once the handler
//! returns.

use crate::address::{Endpoint, NodeAddress};
use crate::protocol::Payload;
use crate::swim::MembershipTable;
use crate::timer::TimerRegistry;
use rand::rngs::StdRng;

/// A message a handler wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Routed according to the destination's reachability (via a relay
    /// parent when it is NAT-ed).
    Routed { to: NodeAddress, payload: Payload },
    /// Sent straight to an open endpoint.
    Direct { to: Endpoint, payload: Payload },
}

/// Everything a handler may touch while processing one input.
pub struct Context<'a> {
    pub table: &'a mut MembershipTable,
    pub timers: &'a mut TimerRegistry,
    pub outbox: &'a mut Vec<Outgoing>,
    pub rng: &'a mut StdRng,
}

impl Context<'_> {
    pub fn send(&mut self, to: &NodeAddress, payload: Payload) {
        self.outbox.push(Outgoing::Routed {
            to: to.clone(),
            payload,
        });
    }

    pub fn send_direct(&mut self, to: Endpoint, payload: Payload) {
        self.outbox.push(Outgoing::Direct { to, payload });
    }
}
