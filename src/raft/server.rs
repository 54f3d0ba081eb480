use super::{Envelope, Node, NodeID, Options, Transport, BROADCAST};
use crate::errinput;
use crate::error::Result;

use log::{debug, warn};
use std::time::Instant;

/// A replica server: the single-threaded event loop driving a Raft node.
///
/// All state is owned by the loop. Each iteration promotes a candidate that
/// gathered a quorum, waits for one message with a bounded timeout, runs the
/// election timer, dispatches the message to the node, and flushes the node's
/// outbound messages to the transport. Handlers run to completion; the
/// transport wait is the only suspension point.
pub struct Server<T: Transport> {
    node: Node,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    transport: T,
    opts: Options,
}

impl<T: Transport> Server<T> {
    /// Creates a new replica server with default options.
    pub fn new(id: NodeID, peers: Vec<NodeID>, transport: T) -> Result<Self> {
        Self::with_options(id, peers, transport, Options::default())
    }

    /// Creates a new replica server. The cluster must have at least three
    /// replicas for a meaningful quorum.
    pub fn with_options(
        id: NodeID,
        peers: Vec<NodeID>,
        transport: T,
        opts: Options,
    ) -> Result<Self> {
        if peers.len() < 2 {
            return errinput!("a cluster requires at least two peers");
        }
        if peers.contains(&id) {
            return errinput!("peers can't include this replica");
        }
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, peers, node_tx, opts.clone());
        Ok(Self { node, node_rx, transport, opts })
    }

    /// Serves the replica until killed or the transport fails.
    pub fn serve(mut self) -> Result<()> {
        let mut last_event = Instant::now();
        let mut last_heartbeat = Instant::now();
        loop {
            // A candidate that gathered a quorum assumes leadership.
            self.node = self.node.try_win()?;
            self.flush()?;

            // Leaders wake up for heartbeats; everyone else can sleep until
            // their election timeout.
            let wait = if self.node.is_leader() {
                self.opts.heartbeat_interval
            } else {
                self.node.election_timeout()
            };
            let msg = match self.transport.recv(wait)? {
                Some(frame) if frame.is_empty() => None,
                Some(frame) => match Envelope::decode(&frame) {
                    Ok(envelope)
                        if envelope.dst == *self.node.id() || envelope.dst == BROADCAST =>
                    {
                        Some(envelope)
                    }
                    Ok(envelope) => {
                        debug!("Dropping message addressed to {}", envelope.dst);
                        None
                    }
                    Err(err) => {
                        warn!("Dropping malformed message: {err}");
                        None
                    }
                },
                None => None,
            };

            // Peer protocol traffic defers our election timer, both before
            // and after dispatch (the handlers themselves can take time).
            if msg.as_ref().is_some_and(|m| m.message.resets_timer()) {
                last_event = Instant::now();
            }
            if !self.node.is_leader() && last_event.elapsed() > self.node.election_timeout() {
                self.node = self.node.campaign()?;
                last_event = Instant::now();
            }
            if let Some(envelope) = msg {
                let resets = envelope.message.resets_timer();
                self.node = self.node.step(envelope)?;
                if resets {
                    last_event = Instant::now();
                }
            }

            if self.node.is_leader() {
                if last_heartbeat.elapsed() >= self.opts.heartbeat_interval {
                    self.node.heartbeat()?;
                    last_heartbeat = Instant::now();
                }
                // When traffic goes quiet, answer any reads still queued.
                if last_event.elapsed() >= self.opts.read_drain_idle {
                    self.node.drain_reads()?;
                }
            }

            self.flush()?;
        }
    }

    /// Flushes the node's outbound messages to the transport.
    fn flush(&mut self) -> Result<()> {
        while let Ok(envelope) = self.node_rx.try_recv() {
            debug!("Sending {:?}", envelope);
            self.transport.send(&envelope.encode()?)?;
        }
        Ok(())
    }
}
