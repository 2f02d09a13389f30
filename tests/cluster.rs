//! End-to-end cluster tests over real TCP on loopback.
//!
//! Each test runs its own in-process cluster on a dedicated port range, so
//! tests can run concurrently. Nodes use the system clock; assertions poll
//! with a generous timeout instead of assuming scheduling.

use shard_consensus::consensus::{
    integrity, Address, Configuration, Index, ManualClock, MemberId, Node, StateMachine,
};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long to wait for cluster-wide conditions before failing.
const TIMEOUT: Duration = Duration::from_secs(10);

/// Records applied operations, shared with the test body.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(Index, Vec<u8>)>>>);

impl Recorder {
    fn applied(&self) -> Vec<(Index, Vec<u8>)> {
        self.0.lock().unwrap().clone()
    }
}

impl StateMachine for Recorder {
    fn apply(&mut self, index: Index, operation: &[u8]) {
        self.0.lock().unwrap().push((index, operation.to_vec()));
    }
}

/// An in-process cluster. Nodes can be stopped (crash-stop) and restarted
/// with an empty log, which must then converge from the leader.
struct TestCluster {
    config: Configuration,
    nodes: Vec<Option<Node>>,
    recorders: Vec<Recorder>,
}

impl TestCluster {
    /// Starts a cluster of the given size on the given port range.
    fn run(base_port: u16, size: u16) -> Self {
        let config = Configuration::from_addresses(
            (0..size).map(|i| Address::new("127.0.0.1", base_port + i)),
        );
        let mut nodes = Vec::new();
        let mut recorders = Vec::new();
        for id in 0..size as MemberId {
            let recorder = Recorder::default();
            recorders.push(recorder.clone());
            nodes.push(Some(
                Node::new(config.clone(), id, Box::new(recorder)).expect("node failed to start"),
            ));
        }
        Self { config, nodes, recorders }
    }

    fn node(&self, id: MemberId) -> &Node {
        self.nodes[id as usize].as_ref().expect("node is stopped")
    }

    fn live_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().flatten().collect()
    }

    /// The current leader among live nodes, if any.
    fn leader(&self) -> Option<MemberId> {
        self.live_nodes().iter().find(|node| node.is_leader()).map(|node| node.status().id)
    }

    /// Polls until the condition holds, or panics after the timeout.
    fn wait_for(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("timed out waiting for {what}");
    }

    /// Waits for a leader and returns it.
    fn wait_for_leader(&self) -> MemberId {
        self.wait_for("a leader", |cluster| cluster.leader().is_some());
        self.leader().unwrap()
    }

    /// Waits for every live node to reach the given commit index.
    fn wait_for_commit(&self, index: Index) {
        self.wait_for(&format!("commit index {index} everywhere"), |cluster| {
            cluster.live_nodes().iter().all(|node| node.commit_index() >= index)
        });
    }

    /// Stops a node by dropping it: a crash-stop as far as the cluster is
    /// concerned.
    fn stop(&mut self, id: MemberId) {
        let node = self.nodes[id as usize].take().expect("node already stopped");
        node.shutdown().expect("shutdown failed");
    }

    /// Restarts a stopped node with a fresh recorder and an empty log, which
    /// must converge from the leader. Binding retries while the old port
    /// drains.
    fn restart(&mut self, id: MemberId) {
        let recorder = Recorder::default();
        self.recorders[id as usize] = recorder.clone();
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match Node::new(self.config.clone(), id, Box::new(recorder.clone())) {
                Ok(node) => {
                    self.nodes[id as usize] = Some(node);
                    return;
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => panic!("restarting member {id} failed: {err}"),
            }
        }
    }

    fn check_integrity(&self) {
        integrity::check_nodes(&self.live_nodes()).expect("cross-node commit disagreement");
    }
}

#[test]
fn three_nodes_elect_and_commit() {
    let cluster = TestCluster::run(21200, 3);
    let leader = cluster.wait_for_leader();

    cluster.wait_for("full connectivity", |cluster| {
        cluster.live_nodes().iter().all(|node| node.is_fully_connected())
    });

    cluster.node(leader).submit(b"op-A".to_vec());
    cluster.wait_for_commit(1);

    // Every member reports the commit and applied the operation exactly
    // once.
    for id in 0..3 {
        assert_eq!(cluster.node(id).commit_index(), 1, "member {id}");
        assert_eq!(
            cluster.recorders[id as usize].applied(),
            vec![(1, b"op-A".to_vec())],
            "member {id}"
        );
    }

    // Exactly one member leads the term.
    let leaders: Vec<_> =
        cluster.live_nodes().iter().filter(|node| node.is_leader()).map(|n| n.status().id).collect();
    assert_eq!(leaders.len(), 1);
    cluster.check_integrity();
}

#[test]
fn submissions_to_followers_are_forwarded() {
    let cluster = TestCluster::run(21300, 3);
    let leader = cluster.wait_for_leader();
    let follower = (0..3).find(|id| *id != leader).unwrap();

    cluster.node(follower).submit(b"via-follower".to_vec());
    cluster.wait_for_commit(1);

    for id in 0..3 {
        assert_eq!(
            cluster.recorders[id as usize].applied(),
            vec![(1, b"via-follower".to_vec())],
            "member {id}"
        );
    }
    cluster.check_integrity();
}

#[test]
fn submissions_before_an_election_are_buffered() {
    let cluster = TestCluster::run(21400, 3);

    // Submit immediately; depending on timing there may not be a leader
    // yet, in which case the operation is buffered and flushed to whoever
    // wins.
    cluster.node(0).submit(b"early".to_vec());
    cluster.wait_for_commit(1);

    for id in 0..3 {
        assert_eq!(
            cluster.recorders[id as usize].applied(),
            vec![(1, b"early".to_vec())],
            "member {id}"
        );
    }
}

#[test]
fn follower_restart_converges_from_the_leader() {
    let mut cluster = TestCluster::run(21500, 3);
    let leader = cluster.wait_for_leader();

    cluster.node(leader).submit(b"a".to_vec());
    cluster.wait_for_commit(1);

    // Crash a follower; the majority keeps committing.
    let follower = (0..3).find(|id| *id != leader).unwrap();
    cluster.stop(follower);
    cluster.node(leader).submit(b"b".to_vec());
    cluster.node(leader).submit(b"c".to_vec());
    cluster.wait_for_commit(3);

    // The restarted follower comes back with an empty log and converges
    // through backtracking appends, reapplying everything in order.
    cluster.restart(follower);
    cluster.wait_for("restarted follower to converge", |cluster| {
        cluster.node(follower).commit_index() >= 3
    });
    assert_eq!(
        cluster.recorders[follower as usize].applied(),
        vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())],
    );
    cluster.check_integrity();
}

#[test]
fn leader_crash_fails_over() {
    let mut cluster = TestCluster::run(21600, 3);
    let old_leader = cluster.wait_for_leader();
    let old_term = cluster.node(old_leader).term();

    cluster.node(old_leader).submit(b"before-crash".to_vec());
    cluster.wait_for_commit(1);

    // Crash the leader: the remaining majority elects a successor in a
    // later term and keeps serving submissions.
    cluster.stop(old_leader);
    let new_leader = cluster.wait_for_leader();
    assert_ne!(new_leader, old_leader);
    assert!(cluster.node(new_leader).term() > old_term);

    cluster.node(new_leader).submit(b"after-crash".to_vec());
    cluster.wait_for_commit(2);

    // The old leader rejoins as a follower and converges.
    cluster.restart(old_leader);
    cluster.wait_for("old leader to converge", |cluster| {
        cluster.node(old_leader).commit_index() >= 2 && !cluster.node(old_leader).is_leader()
    });
    assert_eq!(
        cluster.recorders[old_leader as usize].applied(),
        vec![(1, b"before-crash".to_vec()), (2, b"after-crash".to_vec())],
    );
    cluster.check_integrity();
}

#[test]
fn injected_clock_controls_elections() {
    let config = Configuration::from_addresses([Address::new("127.0.0.1", 21800)]);
    let clock = Arc::new(ManualClock::new());
    let recorder = Recorder::default();
    let node = Node::with_clock(config, 0, Box::new(recorder.clone()), clock.clone())
        .expect("node failed to start");

    // With time frozen, no election timeout can ever pass, however long we
    // actually wait.
    std::thread::sleep(Duration::from_millis(700));
    assert!(!node.is_leader());
    assert_eq!(node.term(), 0);

    // Advancing past the timeout makes the single member elect itself, and
    // as its own majority it commits without any peers.
    clock.advance(Duration::from_secs(1));
    let deadline = Instant::now() + TIMEOUT;
    while !node.is_leader() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
    }
    assert!(node.is_leader(), "single member failed to elect itself");

    node.submit(b"solo".to_vec());
    let deadline = Instant::now() + TIMEOUT;
    while node.commit_index() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
    }
    assert_eq!(node.commit_index(), 1);
    assert_eq!(recorder.applied(), vec![(1, b"solo".to_vec())]);
    node.shutdown().expect("shutdown failed");
}

#[test]
fn status_reflects_cluster_health() {
    let cluster = TestCluster::run(21700, 3);
    let leader = cluster.wait_for_leader();

    cluster.wait_for("full connectivity", |cluster| {
        cluster.live_nodes().iter().all(|node| node.is_fully_connected())
    });
    cluster.node(leader).submit(b"x".to_vec());
    cluster.wait_for_commit(1);

    for id in 0..3 {
        let status = cluster.node(id).status();
        assert_eq!(status.id, id);
        assert_eq!(status.is_leader, id == leader);
        assert_eq!(status.leader, Some(leader), "member {id}");
        assert!(status.term >= 1);
        assert!(status.log_size >= status.commit_index);
        assert_eq!(status.active_connections, 2, "member {id}");
        assert!(status.is_fully_connected, "member {id}");
    }

    // Empty submissions are accepted as no-ops.
    cluster.node(leader).submit(Vec::new());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(cluster.node(leader).commit_index(), 1);
}
