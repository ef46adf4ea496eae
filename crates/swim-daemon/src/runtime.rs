//! Node runtime: hosts one [`Node`] on a tokio task.
//!
//! The node is owned by a single actor task that consumes one event at a
//! time from its inbox (received datagrams, fired timers, control commands)
//! and carries out the effects. A separate task reads the socket and feeds
//! the inbox, so the node itself never waits on I/O.

use anyhow::{Context as _, Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use swim_core::protocol::{Datagram, MAX_DATAGRAM_SIZE};
use swim_core::{
    DatagramTransport, Effect, Input, Node, NodeId, NodeSnapshot, TimerId, TransportError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::timers::TimerService;

/// Something for the actor to process.
#[derive(Debug)]
enum Event {
    Received { from: SocketAddr, data: Vec<u8> },
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Shutdown,
}

/// Control handle for a running node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    inbox: mpsc::UnboundedSender<Event>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current membership view of the node.
    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Event::Snapshot(tx))
            .map_err(|_| anyhow!("node {} has stopped", self.id))?;
        rx.await.map_err(|_| anyhow!("node {} has stopped", self.id))
    }

    /// Ask the node to stop. The runtime task then finishes with `Ok`.
    pub fn shutdown(&self) {
        if self.inbox.send(Event::Shutdown).is_err() {
            debug!("{} already stopped", self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inbox.is_closed()
    }
}

pub struct NodeRuntime {
    node: Node,
    transport: Arc<dyn DatagramTransport>,
    timers: TimerService,
    timer_rx: mpsc::UnboundedReceiver<TimerId>,
    inbox: mpsc::UnboundedReceiver<Event>,
    receiver: JoinHandle<()>,
}

impl NodeRuntime {
    /// Start `node` on `transport`.
    ///
    /// Returns the control handle and the runtime task. The task finishes
    /// with `Err` if the node hits a protocol violation.
    pub fn spawn(
        node: Node,
        transport: Arc<dyn DatagramTransport>,
    ) -> (NodeHandle, JoinHandle<Result<()>>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            id: node.id(),
            inbox: inbox_tx.clone(),
        };
        let receiver = tokio::spawn(receive_loop(node.id(), transport.clone(), inbox_tx));

        let runtime = Self {
            node,
            transport,
            timers: TimerService::new(timer_tx),
            timer_rx,
            inbox,
            receiver,
        };
        let task = tokio::spawn(runtime.run());
        (handle, task)
    }

    async fn run(mut self) -> Result<()> {
        let result = self.event_loop().await;
        self.receiver.abort();
        self.timers.cancel_all();
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        self.apply(Input::Start).await?;

        loop {
            tokio::select! {
                Some(event) = self.inbox.recv() => match event {
                    Event::Received { from, data } => match Datagram::from_bytes(&data) {
                        Ok(datagram) => self.apply(Input::Datagram { from, datagram }).await?,
                        Err(e) => warn!(
                            "{} dropping undecodable datagram from {} ({} bytes): {}",
                            self.node.id(),
                            from,
                            data.len(),
                            e
                        ),
                    },
                    Event::Snapshot(reply) => {
                        let _ = reply.send(self.node.snapshot());
                    }
                    Event::Shutdown => {
                        info!("{} shutting down", self.node.id());
                        self.apply(Input::Stop).await?;
                        return Ok(());
                    }
                },
                Some(timer) = self.timer_rx.recv() => {
                    self.timers.fired(timer);
                    self.apply(Input::TimerFired(timer)).await?;
                }
                else => return Ok(()),
            }
        }
    }

    /// Feed one input to the node and carry out its effects.
    async fn apply(&mut self, input: Input) -> Result<()> {
        let effects = self
            .node
            .handle(input)
            .with_context(|| format!("node {} stopped on a protocol violation", self.node.id()))?;

        for effect in effects {
            match effect {
                Effect::Transmit { to, datagram } => {
                    let bytes = match datagram.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("{} dropping {} to {}: {}", self.node.id(), datagram.payload.kind(), to, e);
                            continue;
                        }
                    };
                    trace!("{} sending {} bytes to {}", self.node.id(), bytes.len(), to);
                    // Lost sends look like network loss to the protocol
                    if let Err(e) = self.transport.send_to(to, &bytes).await {
                        warn!("{} send to {} failed: {}", self.node.id(), to, e);
                    }
                }
                Effect::Timer(op) => self.timers.apply(op),
            }
        }
        Ok(())
    }
}

/// Read datagrams off the socket into the actor's inbox.
async fn receive_loop(
    id: NodeId,
    transport: Arc<dyn DatagramTransport>,
    inbox: mpsc::UnboundedSender<Event>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match transport.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let data = buf[..len].to_vec();
                if inbox.send(Event::Received { from, data }).is_err() {
                    break;
                }
            }
            Err(TransportError::Closed) => {
                debug!("{} transport closed", id);
                break;
            }
            Err(e) => warn!("{} receive failed: {}", id, e),
        }
    }
}
