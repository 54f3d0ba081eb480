use super::{Entry, Envelope, Index, KeyValue, Log, Message, BROADCAST};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::cmp;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

/// A replica ID: the name of its socket.
pub type NodeID = String;

/// A leader term. Monotonically non-decreasing, except that a withdrawing
/// candidate undoes its own increment.
pub type Term = u64;

/// Raft node options. Defaults follow the protocol constants; tests narrow
/// the timing to keep elections fast and deterministic.
#[derive(Clone, Debug)]
pub struct Options {
    /// The range the per-process election timeout is drawn from.
    pub election_timeout_range: std::ops::Range<Duration>,
    /// How much a withdrawing candidate extends its election timeout.
    pub election_retry_penalty: Duration,
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// How long the leader must be idle before force-draining queued reads.
    pub read_drain_idle: Duration,
    /// Maximum entries per append message once a peer's backlog exceeds
    /// append_backlog.
    pub max_append_entries: usize,
    /// The backlog size beyond which appends are batched.
    pub append_backlog: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout_range: super::ELECTION_TIMEOUT_MIN..super::ELECTION_TIMEOUT_MAX,
            election_retry_penalty: super::ELECTION_RETRY_PENALTY,
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            read_drain_idle: super::READ_DRAIN_IDLE,
            max_append_entries: super::MAX_APPEND_ENTRIES,
            append_backlog: super::APPEND_BACKLOG,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by the
/// event loop, which steps inbound messages and triggers elections and
/// heartbeats. step() and the role transitions consume the current node and
/// return a new one with a possibly different role. Outbound messages are
/// sent via the node_tx channel and flushed to the socket by the event loop.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step(msg)?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower.
    pub fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Self {
        RawNode::new(id, peers, node_tx, opts).into()
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns true if the node is currently the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, Node::Leader(_))
    }

    /// Returns the node's election timeout. Drawn once at startup, but
    /// extended when a candidate withdraws from a lost election.
    pub fn election_timeout(&self) -> Duration {
        match self {
            Node::Candidate(n) => n.election_timeout,
            Node::Follower(n) => n.election_timeout,
            Node::Leader(n) => n.election_timeout,
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Starts (or restarts) an election after an election timeout. Leaders
    /// don't campaign.
    pub fn campaign(self) -> Result<Self> {
        match self {
            Node::Follower(n) => Ok(n.into_candidate()?.into()),
            Node::Candidate(n) => Ok(n.recampaign()?.into()),
            node @ Node::Leader(_) => Ok(node),
        }
    }

    /// Assumes leadership if we're a candidate holding a quorum of votes.
    /// Called at the top of every event loop iteration.
    pub fn try_win(self) -> Result<Self> {
        match self {
            Node::Candidate(n) if n.role.supporters.len() >= n.quorum_size() => {
                Ok(n.into_leader()?.into())
            }
            node => Ok(node),
        }
    }

    /// Broadcasts a leader heartbeat. No-op for other roles.
    pub fn heartbeat(&self) -> Result<()> {
        match self {
            Node::Leader(n) => n.heartbeat(),
            _ => Ok(()),
        }
    }

    /// Answers any queued reads that no longer wait on in-flight writes.
    /// No-op for other roles.
    pub fn drain_reads(&mut self) -> Result<()> {
        match self {
            Node::Leader(n) => n.drain_reads(),
            _ => Ok(()),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A client read deferred behind writes that were in flight when it arrived.
struct Read {
    /// The client that submitted the read.
    client: NodeID,
    /// The client's message ID.
    mid: String,
    /// The key to read.
    key: String,
    /// The last log index at intake; the read is served once this commits.
    received_at: Index,
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>. See:
/// http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: Vec<NodeID>,
    log: Log,
    state: KeyValue,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    term: Term,
    /// The highest term in which we've granted a vote.
    voted_in: Term,
    /// The believed leader, or BROADCAST if unknown.
    leader: NodeID,
    commit_index: Index,
    last_applied: Index,
    /// Deferred client reads. Kept across role changes, drained while leader.
    reads: VecDeque<Read>,
    election_timeout: Duration,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            term: self.term,
            voted_in: self.voted_in,
            leader: self.leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            reads: self.reads,
            election_timeout: self.election_timeout,
            role,
        }
    }

    /// Returns the quorum size: a strict majority of the cluster.
    fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Sends a message with the standard envelope.
    fn send(&self, to: &str, message: Message) -> Result<()> {
        self.send_envelope(Envelope {
            src: self.id.clone(),
            dst: to.to_string(),
            leader: self.leader.clone(),
            message,
        })
    }

    /// Sends a raw envelope.
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        Ok(self.node_tx.send(envelope)?)
    }

    /// Redirects a misdirected client to the leader, or to ourselves when the
    /// leader is unknown, to give the client a concrete next hop.
    fn send_redirect(&self, client: &NodeID, mid: String) -> Result<()> {
        let leader =
            if self.leader == BROADCAST { self.id.clone() } else { self.leader.clone() };
        self.send_envelope(Envelope {
            src: self.id.clone(),
            dst: client.clone(),
            leader,
            message: Message::Redirect { mid },
        })
    }

    /// Sends a vote response carrying our own log position, which lets a
    /// rejected candidate tell a split vote between equals from a loss.
    fn send_vote(&self, to: &NodeID, granted: bool) -> Result<()> {
        self.send(
            to,
            Message::Vote {
                term: self.term,
                last_index: self.log.last_index(),
                last_term: self.log.last_term(),
                granted,
            },
        )
    }

    /// Broadcasts a vote solicitation for our current term.
    fn solicit(&self) -> Result<()> {
        self.send(
            BROADCAST,
            Message::RequestVote {
                term: self.term,
                candidate_id: self.id.clone(),
                last_index: self.log.last_index(),
                last_term: self.log.last_term(),
            },
        )
    }

    /// Decides a vote solicitation and sends the response. Returns true if
    /// the vote was granted, in which case the caller must drop to follower.
    ///
    /// The rules, in order: never vote twice in a term; never vote for a log
    /// behind ours; always vote for a log ahead of ours; with equal logs,
    /// reject an equal rival while we campaign in the same term, and only
    /// vote in terms newer than our own, stepping into the new term.
    fn request_vote(
        &mut self,
        src: &NodeID,
        term: Term,
        last_index: Index,
        last_term: Term,
        campaigning: bool,
    ) -> Result<bool> {
        let (my_last_index, my_last_term) = (self.log.last_index(), self.log.last_term());

        let granted = if term <= self.voted_in || last_term < my_last_term {
            false
        } else if last_term > my_last_term {
            true
        } else if last_index < my_last_index {
            false
        } else if last_index > my_last_index {
            true
        } else if campaigning && term == self.term {
            false
        } else if self.term >= term {
            false
        } else {
            // An equal log soliciting in a later term: step into the term as
            // a leaderless follower and grant.
            self.term = term;
            self.leader = BROADCAST.to_string();
            true
        };

        if granted {
            info!("Voting for {} in term {} election", src, term);
            self.voted_in = term;
        }
        self.send_vote(src, granted)?;
        Ok(granted)
    }

    /// Rejects an append from a stale leader. The confirmation carries our
    /// newer term, which makes the stale leader step down; its own term check
    /// stops it from acting on the cursor hints.
    fn reject_stale_append(&self, src: &NodeID, prev_index: Index) -> Result<()> {
        let match_index = cmp::min(self.log.last_index(), prev_index);
        self.send(
            src,
            Message::Confirmation {
                term: self.term,
                success: false,
                last_index: match_index,
                last_term: self.log.term_at(match_index),
            },
        )
    }
}

/// A follower replicates state from a leader.
pub struct Follower;

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower. The election timeout is
    /// drawn once here and only changes via the candidate withdrawal penalty.
    fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Self {
        let peers = peers.into_iter().sorted().collect_vec();
        let election_timeout = rand::thread_rng().gen_range(opts.election_timeout_range.clone());
        Self {
            id,
            peers,
            log: Log::new(),
            state: KeyValue::new(),
            node_tx,
            opts,
            term: 1,
            voted_in: 0,
            leader: BROADCAST.to_string(),
            commit_index: 0,
            last_applied: 0,
            reads: VecDeque::new(),
            election_timeout,
            role: Follower,
        }
    }

    /// Adopts the given leader and term. The term can't regress.
    fn follow(&mut self, leader: NodeID, term: Term) {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        if leader != self.leader || term != self.term {
            info!("Following leader {} in term {}", leader, term);
        }
        self.term = term;
        self.leader = leader;
    }

    /// Transitions the follower into a candidate, campaigning in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        self.term += 1;
        self.leader = BROADCAST.to_string();
        info!("Starting election for term {}", self.term);
        let supporters = HashSet::from([self.id.clone()]);
        let node = self.into_role(Candidate { supporters });
        node.solicit()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        let Envelope { src, leader, message, .. } = msg;
        match message {
            // Clients must talk to the leader.
            Message::Get { mid, .. } | Message::Put { mid, .. } => {
                self.send_redirect(&src, mid)?;
                Ok(self.into())
            }

            Message::RequestVote { term, last_index, last_term, .. } => {
                self.request_vote(&src, term, last_index, last_term, false)?;
                Ok(self.into())
            }

            Message::AppendEntry { term, prev_index, prev_term, leader_commit, entries, .. } => {
                self.append_entries(&src, leader, term, prev_index, prev_term, leader_commit, entries)
            }

            // Votes outside a campaign and confirmations outside leadership
            // are stale responses from a previous role; drop them.
            Message::Vote { .. }
            | Message::Confirmation { .. }
            | Message::Redirect { .. }
            | Message::Ok { .. } => {
                debug!("Dropping stale message {:?}", message);
                Ok(self.into())
            }
        }
    }

    /// Processes an appendEntry from a leader. Heartbeats (empty entries)
    /// only refresh the leader and term; appends run the log consistency
    /// check, splice on a match, and reply with a confirmation either way.
    fn append_entries(
        mut self,
        src: &NodeID,
        leader: NodeID,
        term: Term,
        prev_index: Index,
        prev_term: Term,
        leader_commit: Index,
        entries: Vec<Entry>,
    ) -> Result<Node> {
        if term < self.term {
            debug!("Rejecting appendEntry from stale term {}", term);
            if !entries.is_empty() {
                self.reject_stale_append(src, prev_index)?;
            }
            return Ok(self.into());
        }
        self.follow(leader, term);

        if entries.is_empty() {
            return Ok(self.into());
        }

        // The consistency check: our entry at the leader's previous index
        // must match its term. Walk the index down to our log head first if
        // the leader's is beyond it.
        let match_index = cmp::min(self.log.last_index(), prev_index);
        let match_term = self.log.term_at(match_index);
        if (match_index, match_term) != (prev_index, prev_term) {
            debug!("Rejecting entries at base {}@{}", prev_index, prev_term);
            self.send(
                src,
                Message::Confirmation {
                    term: self.term,
                    success: false,
                    last_index: match_index,
                    last_term: match_term,
                },
            )?;
            return Ok(self.into());
        }

        self.log.truncate_and_extend(match_index + 1, entries);
        self.send(
            src,
            Message::Confirmation {
                term: self.term,
                success: true,
                last_index: self.log.last_index(),
                last_term: self.log.last_term(),
            },
        )?;

        // Advance the commit index, clamped to our log head; never regress
        // it. Followers apply at most one entry per accepted append, since a
        // live leader's stream of appends drains the rest.
        let commit = cmp::min(leader_commit, self.log.last_index());
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        if self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.log.entry_at(self.last_applied);
            if !entry.is_noop() {
                debug!("Applying {:?}", entry);
                let entry = entry.clone();
                self.state.apply(&entry);
            }
        }
        Ok(self.into())
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    supporters: HashSet<NodeID>,
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Restarts the campaign in yet another term, after an election timeout
    /// without a winner.
    fn recampaign(mut self) -> Result<Self> {
        self.term += 1;
        self.leader = BROADCAST.to_string();
        self.role.supporters = HashSet::from([self.id.clone()]);
        info!("Restarting election for term {}", self.term);
        self.solicit()?;
        Ok(self)
    }

    /// Transitions the candidate to a leader once the event loop finds a
    /// quorum of supporters. Announces leadership with a heartbeat, then
    /// proposes a no-op entry for the new term: committing it is what lets
    /// us commit any entries left over from previous terms (see section 8
    /// in the Raft paper).
    fn into_leader(mut self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        self.leader = self.id.clone();
        self.reads.clear();
        let next_index = self.log.len();
        let progress = self
            .peers
            .iter()
            .cloned()
            .map(|peer| (peer, Progress { next_index, match_index: 0 }))
            .collect();
        let mut node = self.into_role(Leader { progress });
        node.heartbeat()?;
        let noop = Entry::noop(node.term);
        node.propose(noop)?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        let Envelope { src, leader, message, .. } = msg;
        match message {
            // A vote came in. Collect support; the event loop promotes us
            // once we hold a quorum. Only peers get a say.
            Message::Vote { granted: true, .. } => {
                if self.peers.contains(&src) {
                    self.role.supporters.insert(src);
                }
                Ok(self.into())
            }

            // A rejection from an equal peer campaigning in our term is a
            // split vote: keep waiting, the timeout stagger breaks the tie.
            // Any other rejection means we lost: withdraw as if the election
            // never started, and back off to let the winner consolidate.
            Message::Vote { term, last_index, last_term, granted: false } => {
                if !self.peers.contains(&src) {
                    debug!("Dropping vote from unknown sender {}", src);
                    return Ok(self.into());
                }
                let split = (last_index, last_term, term)
                    == (self.log.last_index(), self.log.last_term(), self.term);
                if split {
                    debug!("Split vote against equal peer {}", src);
                    return Ok(self.into());
                }
                info!("Withdrawing from election for term {}", self.term);
                self.term -= 1;
                self.election_timeout += self.opts.election_retry_penalty;
                Ok(self.into_role(Follower).into())
            }

            Message::RequestVote { term, last_index, last_term, .. } => {
                if self.request_vote(&src, term, last_index, last_term, true)? {
                    return Ok(self.into_role(Follower).into());
                }
                Ok(self.into())
            }

            // A leader emerged in a current or newer term: follow it and
            // process the message as a follower.
            Message::AppendEntry { term, prev_index, prev_term, leader_commit, entries, .. } => {
                if term < self.term {
                    debug!("Rejecting appendEntry from stale term {}", term);
                    if !entries.is_empty() {
                        self.reject_stale_append(&src, prev_index)?;
                    }
                    return Ok(self.into());
                }
                self.into_role(Follower).append_entries(
                    &src,
                    leader,
                    term,
                    prev_index,
                    prev_term,
                    leader_commit,
                    entries,
                )
            }

            Message::Get { mid, .. } | Message::Put { mid, .. } => {
                self.send_redirect(&src, mid)?;
                Ok(self.into())
            }

            Message::Confirmation { .. } | Message::Redirect { .. } | Message::Ok { .. } => {
                debug!("Dropping stale message {:?}", message);
                Ok(self.into())
            }
        }
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next log index to send. Advanced optimistically on dispatch and
    /// rewound by failed confirmations. Never below 1.
    next_index: Index,
    /// The highest log index known to be replicated on the peer.
    match_index: Index,
}

/// A leader serves client requests and replicates the log to followers.
pub struct Leader {
    /// Per-peer replication progress. Cleared on role exit.
    progress: BTreeMap<NodeID, Progress>,
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        let Envelope { src, leader, message, .. } = msg;
        match message {
            // Append the write to our log and replicate it. The client's ok
            // is only sent once the entry commits and applies.
            Message::Put { mid, key, value } => {
                let entry = Entry {
                    term: self.term,
                    key,
                    value,
                    client_id: src,
                    request_id: mid,
                };
                self.propose(entry)?;
                Ok(self.into())
            }

            // Serve the read from the state machine, unless writes are still
            // in flight ahead of it: a read must never see a value older than
            // a write we've already accepted.
            Message::Get { mid, key } => {
                if self.commit_index < self.log.last_index() {
                    let received_at = self.log.last_index();
                    self.reads.push_back(Read { client: src, mid, key, received_at });
                } else {
                    self.drain_reads()?;
                    let value = self.state.lookup(&key);
                    self.send(&src, Message::Ok { mid, value: Some(value) })?;
                }
                Ok(self.into())
            }

            Message::Confirmation { term, success, last_index, last_term } => {
                // A newer term means we've been deposed.
                if self.term < term {
                    info!("Discovered new term {}, stepping down", term);
                    let mut node = self.into_role(Follower);
                    node.follow(leader, term);
                    return Ok(node.into());
                }
                if term < self.term {
                    debug!("Dropping confirmation from stale term {}", term);
                    return Ok(self.into());
                }
                if !self.role.progress.contains_key(&src) {
                    debug!("Dropping confirmation from unknown sender {}", src);
                    return Ok(self.into());
                }
                if success {
                    self.confirm(&src, last_index)?;
                } else {
                    self.rewind(&src, last_index, last_term)?;
                }
                Ok(self.into())
            }

            Message::RequestVote { term, last_index, last_term, .. } => {
                if self.request_vote(&src, term, last_index, last_term, false)? {
                    return Ok(self.into_role(Follower).into());
                }
                Ok(self.into())
            }

            // Another leader in a current or newer term; follow it.
            Message::AppendEntry { term, prev_index, prev_term, leader_commit, entries, .. } => {
                if term < self.term {
                    debug!("Rejecting appendEntry from stale term {}", term);
                    if !entries.is_empty() {
                        self.reject_stale_append(&src, prev_index)?;
                    }
                    return Ok(self.into());
                }
                self.into_role(Follower).append_entries(
                    &src,
                    leader,
                    term,
                    prev_index,
                    prev_term,
                    leader_commit,
                    entries,
                )
            }

            // Votes can trickle in after we won; ignore them.
            Message::Vote { .. } | Message::Redirect { .. } | Message::Ok { .. } => {
                debug!("Dropping stale message {:?}", message);
                Ok(self.into())
            }
        }
    }

    /// Broadcasts an empty append as a heartbeat, suppressing follower
    /// election timeouts.
    fn heartbeat(&self) -> Result<()> {
        self.send(
            BROADCAST,
            Message::AppendEntry {
                term: self.term,
                prev_index: self.log.last_index(),
                prev_term: self.log.last_term(),
                leader_commit: self.commit_index,
                leader_applied: self.last_applied,
                entries: Vec::new(),
            },
        )
    }

    /// Appends an entry to our log and replicates it, returning its index.
    fn propose(&mut self, entry: Entry) -> Result<Index> {
        let index = self.log.append(entry);
        self.replicate()?;
        Ok(index)
    }

    /// Sends pending entries to every peer with a backlog.
    fn replicate(&mut self) -> Result<()> {
        for peer in self.peers.clone() {
            self.send_append(&peer)?;
        }
        Ok(())
    }

    /// Sends pending entries to a peer, according to its next_index. Large
    /// backlogs are batched; the rest catches up as confirmations arrive.
    /// The cursor advances optimistically on dispatch, and is corrected by a
    /// failed confirmation if the peer's log diverges.
    fn send_append(&mut self, peer: &NodeID) -> Result<()> {
        let progress = self.role.progress.get(peer).expect("unknown peer");
        assert!(progress.next_index >= 1, "next_index below 1 for {peer}");
        let next = progress.next_index;
        if next >= self.log.len() {
            return Ok(());
        }
        let backlog = (self.log.len() - next) as usize;
        let limit =
            if backlog > self.opts.append_backlog { self.opts.max_append_entries } else { backlog };
        let entries = self.log.range(next, limit);
        debug!("Replicating {} entries with base {} to {}", entries.len(), next - 1, peer);

        self.role.progress.get_mut(peer).expect("unknown peer").next_index +=
            entries.len() as Index;
        self.send(
            peer,
            Message::AppendEntry {
                term: self.term,
                prev_index: next - 1,
                prev_term: self.log.term_at(next - 1),
                leader_commit: self.commit_index,
                leader_applied: self.last_applied,
                entries,
            },
        )
    }

    /// Records a successful confirmation and advances the commit index as far
    /// as quorum allows, applying and answering newly committed writes.
    fn confirm(&mut self, peer: &NodeID, match_index: Index) -> Result<()> {
        self.role.progress.get_mut(peer).expect("unknown peer").match_index = match_index;
        self.maybe_commit_and_apply()?;
        // Keep catching up peers that still have a backlog.
        self.replicate()
    }

    /// Rewinds a peer's replication cursor after a failed confirmation, using
    /// the follower's hints, then retries from the new cursor.
    fn rewind(&mut self, peer: &NodeID, hint_index: Index, hint_term: Term) -> Result<()> {
        // Clamp the hint to our log before inspecting terms.
        let hint_index = cmp::min(hint_index, self.log.last_index());
        let matches = self.log.term_at(hint_index) == hint_term;
        let progress = self.role.progress.get_mut(peer).expect("unknown peer");
        if matches && progress.match_index <= hint_index {
            // The hinted entry matches our log: resume right after it.
            progress.next_index = hint_index + 1;
            progress.match_index = hint_index;
        } else {
            // Terms disagree at the hint: probe from the hint itself, but
            // never below the first real entry.
            progress.next_index = cmp::max(hint_index, 1);
        }
        self.send_append(peer)
    }

    /// Commits any entries replicated to a quorum and applies them, sending
    /// ok responses to the waiting writers. A current-term entry replicated
    /// on a majority commits itself and everything before it; older-term
    /// entries are never counted directly (see figure 8 in the Raft paper).
    fn maybe_commit_and_apply(&mut self) -> Result<()> {
        let mut next = self.commit_index + 1;
        while next < self.log.len() {
            if self.log.term_at(next) < self.term {
                next += 1;
                continue;
            }
            let confirms =
                self.role.progress.values().filter(|p| p.match_index >= next).count();
            if confirms + 1 < self.quorum_size() {
                break;
            }
            self.commit_index = next;
            next += 1;
        }

        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.log.entry_at(self.last_applied).clone();
            if entry.is_noop() {
                continue;
            }
            debug!("Applying {:?}", entry);
            self.state.apply(&entry);
            self.send(&entry.client_id, Message::Ok { mid: entry.request_id, value: None })?;
        }

        // Newly committed writes may unblock deferred reads.
        self.drain_reads()
    }

    /// Answers queued reads whose intake index has committed, in queue order.
    fn drain_reads(&mut self) -> Result<()> {
        if self.reads.is_empty() {
            return Ok(());
        }
        let mut deferred = VecDeque::new();
        for read in std::mem::take(&mut self.reads) {
            if read.received_at <= self.commit_index {
                let value = self.state.lookup(&read.key);
                self.send(&read.client, Message::Ok { mid: read.mid, value: Some(value) })?;
            } else {
                deferred.push_back(read);
            }
        }
        self.reads = deferred;
        Ok(())
    }
}
