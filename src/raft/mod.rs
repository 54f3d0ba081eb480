mod log;
mod message;
mod node;
mod server;
mod state;
mod transport;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message};
pub use node::{Node, NodeID, Options, Term};
pub use server::Server;
pub use state::KeyValue;
pub use transport::{Channel, SeqPacket, Transport};

use std::time::Duration;

/// The broadcast address. Also used as the sender's leader field while the
/// leader is unknown.
pub const BROADCAST: &str = "FFFF";

/// The maximum size of a single wire message.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// The election timeout is drawn once per process from this range. A replica
/// that doesn't hear from a leader or candidate for this long campaigns.
const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(500);
const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(3000);

/// How much a candidate extends its election timeout when it withdraws from a
/// lost election, to stagger retries against the winner.
const ELECTION_RETRY_PENALTY: Duration = Duration::from_secs(2);

/// The interval between leader heartbeats. Must be well below the minimum
/// election timeout, or followers will campaign against a live leader.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(150);

/// How long the leader's event loop must be idle before it drains any reads
/// still queued behind unreplicated writes.
const READ_DRAIN_IDLE: Duration = Duration::from_secs(2);

/// The maximum number of entries per append message when a peer's backlog
/// exceeds APPEND_BACKLOG.
const MAX_APPEND_ENTRIES: usize = 50;

/// The backlog size beyond which appends to a peer are batched.
const APPEND_BACKLOG: usize = 100;
