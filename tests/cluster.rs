//! End-to-end cluster tests. Replicas run their real event loops on threads,
//! wired together through the in-memory channel transport by a router thread
//! that plays the cluster socket: it fans out broadcasts, delivers unicasts,
//! and can partition or kill replicas. The test acts as the client.

use quorumkv::raft::{Channel, Envelope, Message, Options, Server, Transport, BROADCAST};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

const CLIENT: &str = "client-1";

/// Narrow timing so elections settle quickly and tests stay fast.
fn fast_options() -> Options {
    Options {
        election_timeout_range: Duration::from_millis(150)..Duration::from_millis(300),
        election_retry_penalty: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        ..Options::default()
    }
}

/// Router control commands.
enum Ctrl {
    /// Blocks traffic between two replicas, in both directions.
    Partition(String, String),
    /// Restores traffic between two replicas.
    Heal(String, String),
    /// Disconnects a replica entirely, killing its server.
    Kill(String),
}

struct Cluster {
    ids: Vec<String>,
    ctrl_tx: Sender<Ctrl>,
    inject_tx: Sender<Vec<u8>>,
    client_rx: Receiver<Envelope>,
    mids: std::cell::Cell<u64>,
}

impl Cluster {
    fn new(ids: &[&str]) -> Self {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut endpoints = HashMap::new();
        for id in &ids {
            let peers = ids.iter().filter(|peer| *peer != id).cloned().collect();
            let (local, remote) = Channel::pair();
            let server =
                Server::with_options(id.clone(), peers, local, fast_options()).unwrap();
            thread::spawn(move || {
                let _ = server.serve(); // exits when the router disconnects it
            });
            endpoints.insert(id.clone(), remote);
        }

        let (ctrl_tx, ctrl_rx) = crossbeam::channel::unbounded();
        let (inject_tx, inject_rx) = crossbeam::channel::unbounded();
        let (client_tx, client_rx) = crossbeam::channel::unbounded();
        let replicas: HashSet<String> = ids.iter().cloned().collect();
        thread::spawn(move || route(replicas, endpoints, ctrl_rx, inject_rx, client_tx));

        Self { ids, ctrl_tx, inject_tx, client_rx, mids: std::cell::Cell::new(0) }
    }

    fn partition(&self, a: &str, b: &str) {
        self.ctrl_tx.send(Ctrl::Partition(a.to_string(), b.to_string())).unwrap();
    }

    fn heal(&self, a: &str, b: &str) {
        self.ctrl_tx.send(Ctrl::Heal(a.to_string(), b.to_string())).unwrap();
    }

    fn kill(&self, id: &str) {
        self.ctrl_tx.send(Ctrl::Kill(id.to_string())).unwrap();
    }

    /// Sends a client message to a replica.
    fn send(&self, dst: &str, message: Message) {
        let envelope = Envelope {
            src: CLIENT.to_string(),
            dst: dst.to_string(),
            leader: BROADCAST.to_string(),
            message,
        };
        self.inject_tx.send(envelope.encode().unwrap()).unwrap();
    }

    fn next_mid(&self, prefix: &str) -> String {
        self.mids.set(self.mids.get() + 1);
        format!("{prefix}-{}", self.mids.get())
    }

    /// Waits for the client response matching the given message ID.
    fn response(&self, mid: &str, timeout: Duration) -> Envelope {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let envelope = self
                .client_rx
                .recv_timeout(wait)
                .unwrap_or_else(|_| panic!("no response for {mid}"));
            match &envelope.message {
                Message::Ok { mid: got, .. } | Message::Redirect { mid: got } if got == mid => {
                    return envelope;
                }
                _ => continue, // stale probe responses
            }
        }
    }

    /// Sends a put to the given replica and returns the response (ok or
    /// redirect).
    fn put(&self, dst: &str, key: &str, value: &str) -> Envelope {
        let mid = self.next_mid("put");
        self.send(
            dst,
            Message::Put { mid: mid.clone(), key: key.to_string(), value: value.to_string() },
        );
        self.response(&mid, Duration::from_secs(10))
    }

    /// Sends a get to the given replica and returns the response.
    fn get(&self, dst: &str, key: &str) -> Envelope {
        let mid = self.next_mid("get");
        self.send(dst, Message::Get { mid: mid.clone(), key: key.to_string() });
        self.response(&mid, Duration::from_secs(10))
    }

    /// Probes the cluster with reads until a replica answers ok, returning
    /// the leader's ID. A leader only serves reads once it has committed an
    /// entry in its own term, so this also waits for a usable leader.
    fn wait_for_leader(&self) -> String {
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            for id in &self.ids {
                self.send(id, Message::Get { mid: self.next_mid("probe"), key: "_".to_string() });
            }
            let until = Instant::now() + Duration::from_millis(300);
            loop {
                let wait = until.saturating_duration_since(Instant::now());
                match self.client_rx.recv_timeout(wait) {
                    Ok(envelope) => {
                        if matches!(envelope.message, Message::Ok { .. }) {
                            return envelope.src;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        panic!("no leader elected within deadline");
    }

    /// Returns some replica other than the given ones.
    fn other(&self, than: &[&String]) -> String {
        self.ids.iter().find(|id| !than.contains(id)).unwrap().clone()
    }
}

/// Routes frames between replicas and the client, honoring partitions.
fn route(
    replicas: HashSet<String>,
    mut endpoints: HashMap<String, Channel>,
    ctrl_rx: Receiver<Ctrl>,
    inject_rx: Receiver<Vec<u8>>,
    client_tx: Sender<Envelope>,
) {
    let mut blocked: HashSet<(String, String)> = HashSet::new();
    loop {
        match ctrl_rx.try_recv() {
            Ok(Ctrl::Partition(a, b)) => {
                blocked.insert((a.clone(), b.clone()));
                blocked.insert((b, a));
            }
            Ok(Ctrl::Heal(a, b)) => {
                blocked.remove(&(a.clone(), b.clone()));
                blocked.remove(&(b, a));
            }
            Ok(Ctrl::Kill(id)) => {
                endpoints.remove(&id);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return, // test finished
        }

        let mut inbox: Vec<Vec<u8>> = Vec::new();
        for endpoint in endpoints.values() {
            while let Ok(Some(frame)) = endpoint.recv(Duration::ZERO) {
                inbox.push(frame);
            }
        }
        inbox.extend(inject_rx.try_iter());

        if inbox.is_empty() {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        for frame in inbox {
            let Ok(envelope) = Envelope::decode(&frame) else { continue };
            if envelope.dst == BROADCAST {
                for (id, endpoint) in &endpoints {
                    if *id != envelope.src
                        && !blocked.contains(&(envelope.src.clone(), id.clone()))
                    {
                        let _ = endpoint.send(&frame);
                    }
                }
            } else if replicas.contains(&envelope.dst) {
                // Frames to killed or partitioned replicas are dropped.
                if !blocked.contains(&(envelope.src.clone(), envelope.dst.clone())) {
                    if let Some(endpoint) = endpoints.get(&envelope.dst) {
                        let _ = endpoint.send(&frame);
                    }
                }
            } else {
                let _ = client_tx.send(envelope);
            }
        }
    }
}

#[test]
fn bootstrap_elects_and_serves() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();

    let response = cluster.put(&leader, "x", "1");
    assert!(matches!(response.message, Message::Ok { value: None, .. }), "{response:?}");

    let response = cluster.get(&leader, "x");
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v == "1"),
        "{response:?}"
    );
}

#[test]
fn unknown_keys_read_as_empty() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();

    let response = cluster.get(&leader, "never-written");
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v.is_empty()),
        "{response:?}"
    );
}

#[test]
fn followers_redirect_to_leader() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();
    let follower = cluster.other(&[&leader]);

    let response = cluster.put(&follower, "x", "1");
    assert!(matches!(response.message, Message::Redirect { .. }), "{response:?}");
    assert_eq!(response.leader, leader);

    // Following the redirect succeeds.
    let response = cluster.put(&response.leader, "x", "1");
    assert!(matches!(response.message, Message::Ok { .. }), "{response:?}");
}

#[test]
fn reads_wait_for_writes_in_flight() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();

    // Fire the write and the read back to back, without waiting: the read
    // must still observe the write.
    let put_mid = cluster.next_mid("put");
    let get_mid = cluster.next_mid("get");
    cluster.send(
        &leader,
        Message::Put { mid: put_mid.clone(), key: "x".to_string(), value: "1".to_string() },
    );
    cluster.send(&leader, Message::Get { mid: get_mid.clone(), key: "x".to_string() });

    let response = cluster.response(&put_mid, Duration::from_secs(10));
    assert!(matches!(response.message, Message::Ok { value: None, .. }), "{response:?}");
    let response = cluster.response(&get_mid, Duration::from_secs(10));
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v == "1"),
        "{response:?}"
    );
}

#[test]
fn failover_preserves_committed_writes() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();

    let response = cluster.put(&leader, "x", "9");
    assert!(matches!(response.message, Message::Ok { .. }), "{response:?}");

    cluster.kill(&leader);
    let successor = cluster.wait_for_leader();
    assert_ne!(successor, leader);

    let response = cluster.get(&successor, "x");
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v == "9"),
        "{response:?}"
    );
}

#[test]
fn partitioned_follower_catches_up() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();
    let lagging = cluster.other(&[&leader]);
    let third = cluster.other(&[&leader, &lagging]);

    // Cut the follower off; the majority still commits.
    cluster.partition(&lagging, &leader);
    cluster.partition(&lagging, &third);
    let response = cluster.put(&leader, "y", "5");
    assert!(matches!(response.message, Message::Ok { .. }), "{response:?}");

    // Heal and let the cluster settle: the cut follower may have campaigned
    // itself into a later term in the meantime, forcing a re-election.
    cluster.heal(&lagging, &leader);
    cluster.heal(&lagging, &third);
    let leader = cluster.wait_for_leader();

    // Push another write through to trigger log repair on the follower.
    let response = cluster.put(&leader, "z", "6");
    assert!(matches!(response.message, Message::Ok { .. }), "{response:?}");

    // Any leader elected among the survivors must serve both writes.
    cluster.kill(&leader);
    let successor = cluster.wait_for_leader();
    let response = cluster.get(&successor, "y");
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v == "5"),
        "{response:?}"
    );
    let response = cluster.get(&successor, "z");
    assert!(
        matches!(response.message, Message::Ok { value: Some(ref v), .. } if v == "6"),
        "{response:?}"
    );
}

#[test]
fn isolated_leader_cannot_commit() {
    let cluster = Cluster::new(&["0000", "0001", "0002"]);
    let leader = cluster.wait_for_leader();
    let follower1 = cluster.other(&[&leader]);
    let follower2 = cluster.other(&[&leader, &follower1]);

    // Isolate the leader from both followers: its writes can't reach quorum,
    // so the client never gets an ok. Writes are held, not rejected.
    cluster.partition(&leader, &follower1);
    cluster.partition(&leader, &follower2);

    let mid = cluster.next_mid("put");
    cluster.send(
        &leader,
        Message::Put { mid: mid.clone(), key: "stuck".to_string(), value: "1".to_string() },
    );
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let wait = deadline.saturating_duration_since(Instant::now());
        if let Ok(envelope) = cluster.client_rx.recv_timeout(wait) {
            match &envelope.message {
                Message::Ok { mid: got, .. } | Message::Redirect { mid: got } => {
                    assert_ne!(got, &mid, "write committed without quorum: {envelope:?}");
                }
                _ => {}
            }
        }
    }

    // The majority side elects a fresh leader and keeps serving.
    let successor = cluster.wait_for_leader();
    assert_ne!(successor, leader);
    let response = cluster.put(&successor, "x", "1");
    assert!(matches!(response.message, Message::Ok { .. }), "{response:?}");
}
