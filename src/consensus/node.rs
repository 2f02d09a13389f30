//! The consensus node: role state machine, replication bookkeeping, and the
//! host-facing handle.
//!
//! A node is always in one of three roles. Followers replicate entries from a
//! leader, or wait leaderless for one to emerge. Candidates campaign for
//! leadership when the election timeout passes without leader contact.
//! Leaders drive replication and commit-index advancement, asserting
//! themselves with periodic heartbeats.
//!
//! All consensus state -- term, role, vote, leader pointer, log, per-peer
//! replication progress -- lives in [`NodeState`] behind a single exclusive
//! lock. Connection reader threads, the consensus loop, and host calls all
//! acquire it for the duration of one message or tick, which linearizes every
//! safety-relevant transition. State transitions push outbound messages onto
//! an outbox which is drained to the peer connections after the lock is
//! released, so connections never see consensus state and the lock is never
//! held across IO.

use super::address::Configuration;
use super::clock::{Clock, SystemClock};
use super::connection::{Connection, Inbound};
use super::log::{Entry, Index, Log};
use super::message::{self, Envelope, Gate, Message};
use super::{
    ACCEPT_POLL_INTERVAL, ELECTION_TIMEOUT_RANGE, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL,
    LOCK_TIMEOUT, TICK_INTERVAL,
};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng as _;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read as _;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A cluster member's index in the configuration. Doubles as the identity
/// exchanged in the connection handshake.
pub type MemberId = u32;

/// A leader election term. Monotonically increasing; at most one leader can
/// be elected per term.
pub type Term = u64;

/// The host-side recipient of committed operations.
///
/// Every replica applies every committed entry exactly once, in index order.
/// Application must be deterministic: replicas diverge if the same operation
/// sequence produces different states.
pub trait StateMachine: Send {
    /// Applies a committed operation at the given log index.
    fn apply(&mut self, index: Index, operation: &[u8]);
}

/// A point-in-time snapshot of node health, for host observability and
/// back-pressure decisions.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub id: MemberId,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub is_leader: bool,
    pub commit_index: Index,
    pub log_size: Index,
    pub active_connections: usize,
    pub is_fully_connected: bool,
}

/// Leader-side replication bookkeeping for one peer. Owned exclusively by the
/// node and indexed by peer slot; connections never see it. Recreated from
/// scratch whenever a new election begins.
#[derive(Clone, Debug, PartialEq)]
struct Progress {
    /// The highest index known replicated to the peer. Monotonically
    /// non-decreasing for the lifetime of the leadership.
    match_index: Index,
    /// The next index to send to the peer.
    next_index: Index,
    /// The peer's most recently reported commit index. Its committed prefix
    /// matches ours, which floors how far appends ever back up.
    remote_commit: Index,
    /// When to resend pending entries if no confirmation arrives. None when
    /// the peer is caught up.
    resend_deadline: Option<Instant>,
}

/// A follower replicates entries from a leader, or waits for one.
#[derive(Clone, Debug, PartialEq)]
struct Follower {
    /// When to give up on the current leader and campaign.
    election_deadline: Instant,
}

/// A candidate campaigns for leadership.
#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<MemberId>,
    /// When to give up on this election and start another.
    election_deadline: Instant,
}

/// A leader replicates its log to the followers.
#[derive(Clone, Debug)]
struct Leader {
    /// Replication progress per peer.
    progress: HashMap<MemberId, Progress>,
    /// When to broadcast the next heartbeat.
    heartbeat_deadline: Instant,
}

/// The node's current role.
#[derive(Clone, Debug)]
enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// The mutable consensus state of a node. Everything in here is protected by
/// the node-wide lock; no field may be read or written outside it.
struct NodeState {
    id: MemberId,
    config: Configuration,
    /// The configuration epoch, bumped by join(). Messages delivered by
    /// connections of a replaced configuration are discarded.
    epoch: u64,
    term: Term,
    role: Role,
    /// Who we voted for in the current term, if anyone.
    voted_for: Option<MemberId>,
    /// The member we believe leads the current term, if known.
    leader: Option<MemberId>,
    log: Log,
    state_machine: Box<dyn StateMachine>,
    /// Operations submitted while no leader was known, flushed in FIFO order
    /// on leader discovery.
    pending: VecDeque<Vec<u8>>,
    /// Peer connections by slot. Populated after construction and swapped
    /// wholesale by join().
    connections: HashMap<MemberId, Arc<Connection>>,
    /// Outbound messages produced under the lock, dispatched to connections
    /// once it is released.
    outbox: Vec<(MemberId, Envelope)>,
}

impl NodeState {
    fn new(
        id: MemberId,
        config: Configuration,
        state_machine: Box<dyn StateMachine>,
        now: Instant,
    ) -> Self {
        let election_deadline = now + random_election_timeout();
        Self {
            id,
            config,
            epoch: 0,
            term: 0,
            role: Role::Follower(Follower { election_deadline }),
            voted_for: None,
            leader: None,
            log: Log::new(),
            state_machine,
            pending: VecDeque::new(),
            connections: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    /// All peer slots, in index order.
    fn peers(&self) -> Vec<MemberId> {
        (0..self.config.size() as MemberId).filter(|peer| *peer != self.id).collect()
    }

    /// Enqueues a message to a peer at our current term.
    fn send(&mut self, to: MemberId, message: Message) {
        self.outbox.push((to, Envelope { term: self.term, message }));
    }

    /// Enqueues a message to every peer.
    fn broadcast(&mut self, message: Message) {
        for peer in self.peers() {
            self.send(peer, message.clone());
        }
    }

    /// Processes one inbound message from a peer. All messages pass the term
    /// gate first; stale traffic never mutates state, future terms are
    /// adopted before processing.
    fn step(&mut self, from: MemberId, envelope: Envelope, now: Instant) {
        if from == self.id || !self.config.contains(from) {
            warn!("dropping message from invalid sender {from}");
            return;
        }

        match message::gate(self.term, &envelope, self.log.size(), self.log.commit_index()) {
            Gate::Stale(reply) => {
                debug!("dropping stale term {} message from peer {from}", envelope.term);
                if let Some(reply) = reply {
                    self.send(from, reply);
                }
                return;
            }
            Gate::AdoptTerm => self.adopt_term(envelope.term, now),
            Gate::Process => {}
        }

        match envelope.message {
            Message::Append { prev_index, prev_term, entries, leader_commit } => {
                self.on_append(from, prev_index, prev_term, entries, leader_commit, now);
            }
            Message::AppendResponse { succeeded, last_index, commit_index } => {
                self.on_append_response(from, succeeded, last_index, commit_index, now);
            }
            Message::Campaign { last_index, last_term } => {
                self.on_campaign(from, last_index, last_term, now);
            }
            Message::CampaignResponse { granted } => {
                self.on_campaign_response(from, granted, now);
            }
            Message::Submit { operation } => self.submit(operation, now),
        }
    }

    /// Handles an Append at our current term: recognize the leader, verify
    /// log consistency, merge the entries, advance the commit index, confirm.
    fn on_append(
        &mut self,
        from: MemberId,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<Entry>,
        leader_commit: Index,
        now: Instant,
    ) {
        // A leader never accepts appends in its own term: that would mean two
        // leaders were elected in one term. Reject defensively.
        if let Role::Leader(_) = self.role {
            error!("append from peer {from} in our own led term {}", self.term);
            let (last_index, commit_index) = (self.log.size(), self.log.commit_index());
            self.send(
                from,
                Message::AppendResponse { succeeded: false, last_index, commit_index },
            );
            return;
        }

        // A candidate seeing entries in its term lost the election.
        if let Role::Candidate(_) = self.role {
            info!("lost election, following leader {from} in term {}", self.term);
            let election_deadline = now + random_election_timeout();
            self.role = Role::Follower(Follower { election_deadline });
        }

        match self.leader {
            // First leader contact this term: adopt it, and flush anything
            // that queued up while we were leaderless.
            None => {
                info!("following leader {from} in term {}", self.term);
                self.leader = Some(from);
                let pending: Vec<_> = self.pending.drain(..).collect();
                for operation in pending {
                    self.send(from, Message::Submit { operation });
                }
            }
            // Entries from a second leader in the same term should be
            // impossible; reject them without touching the log.
            Some(leader) if leader != from => {
                error!("append from peer {from}, but {leader} leads term {}", self.term);
                let (last_index, commit_index) = (self.log.size(), self.log.commit_index());
                self.send(
                    from,
                    Message::AppendResponse { succeeded: false, last_index, commit_index },
                );
                return;
            }
            Some(_) => {}
        }

        // Valid leader contact postpones our election.
        let election_deadline = now + random_election_timeout();
        if let Role::Follower(follower) = &mut self.role {
            follower.election_deadline = election_deadline;
        }

        // The entry preceding the batch must match, or the leader has to
        // back up and resend from an earlier point.
        if self.log.term_at(prev_index) != Some(prev_term) {
            debug!("rejecting append from peer {from}: no entry {prev_index}@{prev_term}");
            let (last_index, commit_index) = (self.log.size(), self.log.commit_index());
            self.send(from, Message::AppendResponse { succeeded: false, last_index, commit_index });
            return;
        }

        // Merge the entries. Matching entries are skipped, making replayed
        // appends idempotent; conflicting uncommitted tails are truncated
        // and replaced; the rest is appended.
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + offset as Index;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    debug!("replacing conflicting entries from index {index}");
                    self.log.truncate_from(index);
                    self.log.append(entry);
                }
                None => {
                    debug_assert_eq!(index, self.log.size() + 1, "append gap at index {index}");
                    self.log.append(entry);
                }
            }
        }

        // Commit and execute what the leader has committed, bounded by what
        // we actually hold.
        self.apply_committed(std::cmp::min(leader_commit, self.log.size()));

        let (last_index, commit_index) = (self.log.size(), self.log.commit_index());
        self.send(from, Message::AppendResponse { succeeded: true, last_index, commit_index });
    }

    /// Handles an append confirmation: track the peer's progress and see
    /// whether any new index now has majority replication.
    fn on_append_response(
        &mut self,
        from: MemberId,
        succeeded: bool,
        last_index: Index,
        commit_index: Index,
        now: Instant,
    ) {
        let log_size = self.log.size();
        let Role::Leader(leader) = &mut self.role else {
            debug!("ignoring append response from peer {from}: not leader");
            return;
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            warn!("append response from peer {from} without progress");
            return;
        };
        // Record the latest report as-is: a follower that restarted with an
        // empty log legitimately regresses. Bounded by its reported length,
        // since a well-formed follower never commits past its own log.
        progress.remote_commit = commit_index.min(last_index);

        if succeeded {
            if last_index > progress.match_index {
                progress.match_index = last_index;
                progress.next_index = last_index + 1;
            }
            if progress.match_index >= log_size {
                // Fully caught up; nothing to retransmit.
                progress.resend_deadline = None;
            }
            self.recheck_commitment(now);
        } else {
            // Back up and resend immediately. The peer's committed prefix
            // always matches ours and its reported length bounds its log, so
            // the resend point lands between the two.
            let next = progress.next_index.saturating_sub(1);
            progress.next_index = next.clamp(progress.remote_commit + 1, last_index + 1);
            debug!("peer {from} rejected append, backing up to {}", progress.next_index);
            self.send_append(from, now);
        }
    }

    /// Handles a vote request at our current term.
    fn on_campaign(&mut self, from: MemberId, last_index: Index, last_term: Term, now: Instant) {
        // Leaders and candidates never grant votes in their own term: the
        // leader was already elected, and a candidate voted for itself.
        if !matches!(self.role, Role::Follower(_)) {
            self.send(from, Message::CampaignResponse { granted: false });
            return;
        }

        // One vote per term, first come first served.
        if self.voted_for.is_some_and(|voted_for| voted_for != from) {
            debug!("rejecting vote for peer {from}: already voted in term {}", self.term);
            self.send(from, Message::CampaignResponse { granted: false });
            return;
        }

        // The candidate's log must be at least as up to date as ours, or it
        // could win an election while missing committed entries.
        let (our_index, our_term) = self.log.last();
        if our_term > last_term || (our_term == last_term && our_index > last_index) {
            debug!("rejecting vote for peer {from}: our log is more up to date");
            self.send(from, Message::CampaignResponse { granted: false });
            return;
        }

        info!("voting for peer {from} in term {} election", self.term);
        self.voted_for = Some(from);
        let election_deadline = now + random_election_timeout();
        if let Role::Follower(follower) = &mut self.role {
            follower.election_deadline = election_deadline;
        }
        self.send(from, Message::CampaignResponse { granted: true });
    }

    /// Handles a vote. Confirmations from a strict majority win the election.
    fn on_campaign_response(&mut self, from: MemberId, granted: bool, now: Instant) {
        let won = {
            let Role::Candidate(candidate) = &mut self.role else {
                debug!("ignoring vote from peer {from}: not campaigning");
                return;
            };
            if !granted {
                debug!("peer {from} rejected our campaign in term {}", self.term);
                return;
            }
            candidate.votes.insert(from);
            candidate.votes.len() >= self.config.majority()
        };
        if won {
            self.become_leader(now);
        }
    }

    /// Submits an operation for replication: append and broadcast as leader,
    /// forward to a known leader, or buffer until one emerges.
    fn submit(&mut self, operation: Vec<u8>, now: Instant) {
        match (&self.role, self.leader) {
            (Role::Leader(_), _) => self.propose(operation, now),
            (_, Some(leader)) if leader != self.id => {
                self.send(leader, Message::Submit { operation });
            }
            _ => {
                debug!("no leader known, queueing operation");
                self.pending.push_back(operation);
            }
        }
    }

    /// Leader: appends an operation to the log and replicates it.
    fn propose(&mut self, operation: Vec<u8>, now: Instant) {
        let index = self.log.append(Entry { term: self.term, operation });
        debug!("appended entry {index} in term {}", self.term);
        for peer in self.peers() {
            self.send_append(peer, now);
        }
        // A single-member cluster commits on its own.
        self.recheck_commitment(now);
    }

    /// Leader: sends entries from the peer's next index, or an empty
    /// heartbeat if it is caught up. Arms the retransmission deadline when
    /// entries are in flight.
    fn send_append(&mut self, peer: MemberId, now: Instant) {
        let leader_commit = self.log.commit_index();
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&peer) else {
            return;
        };
        let prev_index = progress.next_index - 1;
        let prev_term = self
            .log
            .term_at(prev_index)
            .unwrap_or_else(|| panic!("missing base entry {prev_index}"));
        let entries = self.log.entries_from(prev_index + 1);
        if entries.is_empty() {
            debug!("sending heartbeat to peer {peer}");
        } else {
            debug!("replicating {} entries from {} to peer {peer}", entries.len(), prev_index + 1);
            progress.resend_deadline = Some(now + super::APPEND_RESEND_TIMEOUT);
        }
        self.send(peer, Message::Append { prev_index, prev_term, entries, leader_commit });
    }

    /// Leader: scans from the newest log index down for the first index
    /// replicated on a strict majority (counting ourself), and commits
    /// through it. Only entries from our own term commit by counting;
    /// earlier entries commit implicitly with them (Raft paper figure 8).
    fn recheck_commitment(&mut self, now: Instant) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let mut new_commit = None;
        for index in (self.log.commit_index() + 1..=self.log.size()).rev() {
            let support =
                1 + leader.progress.values().filter(|p| p.match_index >= index).count();
            if support >= self.config.majority() {
                if self.log.term_at(index) == Some(self.term) {
                    new_commit = Some(index);
                }
                break;
            }
        }
        let Some(index) = new_commit else {
            return;
        };
        info!("committing through index {index} in term {}", self.term);
        self.apply_committed(index);
        // Propagate the new commit index without waiting for the heartbeat.
        for peer in self.peers() {
            self.send_append(peer, now);
        }
    }

    /// Advances the commit index, executing each newly committed entry
    /// exactly once, in index order.
    fn apply_committed(&mut self, index: Index) {
        let log = &mut self.log;
        let state_machine = &mut self.state_machine;
        log.commit_to(index, |index, entry| state_machine.apply(index, &entry.operation));
    }

    /// Adopts a higher term as a leaderless follower, clearing the vote and
    /// leader. A candidate or leader observing the term yields immediately.
    fn adopt_term(&mut self, term: Term, now: Instant) {
        assert!(term > self.term, "term regression {} -> {term}", self.term);
        info!("discovered term {term}, becoming leaderless follower");
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        let election_deadline = now + random_election_timeout();
        self.role = Role::Follower(Follower { election_deadline });
    }

    /// Starts a new election: bump the term, vote for ourself, solicit votes.
    fn start_election(&mut self, now: Instant) {
        self.term += 1;
        self.leader = None;
        self.voted_for = Some(self.id);
        info!("starting election for term {}", self.term);
        let mut votes = HashSet::new();
        votes.insert(self.id);
        let election_deadline = now + random_election_timeout();
        self.role = Role::Candidate(Candidate { votes, election_deadline });
        let (last_index, last_term) = self.log.last();
        self.broadcast(Message::Campaign { last_index, last_term });
        // A single-member cluster is its own majority.
        if self.config.majority() <= 1 {
            self.become_leader(now);
        }
    }

    /// Ascends to leadership: fresh replication state for every peer, an
    /// immediate append broadcast (the uncommitted tail, or an empty
    /// heartbeat), and a flush of any operations buffered while leaderless.
    fn become_leader(&mut self, now: Instant) {
        info!("won election for term {}, becoming leader", self.term);
        self.leader = Some(self.id);
        // Starting from the commit index rather than the log end makes the
        // first broadcast carry the uncommitted tail; followers that already
        // hold those entries skip them idempotently.
        let next_index = self.log.commit_index() + 1;
        let progress = self
            .peers()
            .into_iter()
            .map(|peer| {
                let progress = Progress {
                    match_index: 0,
                    next_index,
                    remote_commit: 0,
                    resend_deadline: None,
                };
                (peer, progress)
            })
            .collect();
        let heartbeat_deadline = now + HEARTBEAT_INTERVAL;
        self.role = Role::Leader(Leader { progress, heartbeat_deadline });
        for peer in self.peers() {
            self.send_append(peer, now);
        }
        self.recheck_commitment(now);
        let pending: Vec<_> = self.pending.drain(..).collect();
        for operation in pending {
            self.propose(operation, now);
        }
    }

    /// Reassesses all deadlines: elections for followers and candidates,
    /// heartbeats and retransmissions for leaders, liveness for passive
    /// connections.
    fn tick(&mut self, now: Instant) {
        let election_due = match &self.role {
            Role::Follower(follower) => now >= follower.election_deadline,
            Role::Candidate(candidate) => now >= candidate.election_deadline,
            Role::Leader(_) => false,
        };
        if election_due {
            self.start_election(now);
        }

        let mut resend = Vec::new();
        if let Role::Leader(leader) = &mut self.role {
            if now >= leader.heartbeat_deadline {
                leader.heartbeat_deadline = now + HEARTBEAT_INTERVAL;
                resend.extend(leader.progress.keys().copied().sorted());
            } else {
                for (peer, progress) in &leader.progress {
                    if progress.resend_deadline.is_some_and(|deadline| now >= deadline) {
                        resend.push(*peer);
                    }
                }
                resend.sort_unstable();
            }
        }
        for peer in resend {
            self.send_append(peer, now);
        }

        // A silent passive session is presumed dead: close it and let the
        // peer's dialer re-establish the link.
        for connection in self.connections.values() {
            if !connection.is_active() && connection.has_session() && !connection.is_alive() {
                warn!("peer {} went silent, closing session", connection.peer());
                connection.close_session();
            }
        }
    }

    /// The (index, term) pairs of all committed entries, for integrity
    /// checks.
    fn committed_entries(&self) -> Vec<(Index, Term)> {
        (1..=self.log.commit_index())
            .map(|index| (index, self.log.term_at(index).expect("committed entry missing")))
            .collect()
    }

    fn status(&self) -> Status {
        Status {
            id: self.id,
            term: self.term,
            leader: self.leader,
            is_leader: matches!(self.role, Role::Leader(_)),
            commit_index: self.log.commit_index(),
            log_size: self.log.size(),
            active_connections: self.connections.values().filter(|c| c.has_session()).count(),
            is_fully_connected: self
                .connections
                .values()
                .filter(|c| c.has_session())
                .count()
                == self.config.size().saturating_sub(1),
        }
    }
}

/// Generates a randomized election timeout, so simultaneous timeouts don't
/// repeatedly split the vote.
fn random_election_timeout() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE))
}

/// State shared between the node handle and its threads.
struct Shared {
    state: Mutex<NodeState>,
    clock: Arc<dyn Clock>,
    listener: Mutex<TcpListener>,
    disposed: AtomicBool,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Acquires the node lock with a bounded wait. Exceeding the bound means
    /// a deadlock or a stuck host callback, surfaced as a fatal error rather
    /// than blocking forever.
    fn lock_state(&self) -> Result<MutexGuard<'_, NodeState>> {
        self.state
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or_else(|| Error::Internal("node lock not acquired within bounded wait".into()))
    }

    /// Runs a closure under the node lock, then dispatches the produced
    /// outbox to the peer connections with the lock released.
    fn with_state<T>(&self, f: impl FnOnce(&mut NodeState) -> T) -> Result<T> {
        let mut state = self.lock_state()?;
        let result = f(&mut state);
        let outbox = std::mem::take(&mut state.outbox);
        let sends: Vec<(Arc<Connection>, Envelope)> = outbox
            .into_iter()
            .filter_map(|(to, envelope)| {
                state.connections.get(&to).map(|connection| (connection.clone(), envelope))
            })
            .collect();
        drop(state);
        for (connection, envelope) in sends {
            connection.dispatch(envelope);
        }
        Ok(result)
    }
}

impl Inbound for Shared {
    fn receive(&self, from: MemberId, epoch: u64, envelope: Envelope) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let now = self.clock.now();
        self.with_state(|state| {
            if state.epoch != epoch {
                debug!("dropping message from replaced configuration epoch {epoch}");
                return;
            }
            state.step(from, envelope, now);
        })
    }
}

/// A consensus node. Creating one binds the local listen address, connects
/// to all configured peers, and starts the consensus loop; dropping it (or
/// calling [`Node::shutdown`]) stops every thread cooperatively.
pub struct Node {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Creates and starts a node as the given member of the configuration,
    /// using the system clock.
    pub fn new(
        config: Configuration,
        id: MemberId,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        Self::with_clock(config, id, state_machine, Arc::new(SystemClock))
    }

    /// Creates and starts a node with an injected time source.
    pub fn with_clock(
        config: Configuration,
        id: MemberId,
        state_machine: Box<dyn StateMachine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if !config.contains(id) {
            return Err(Error::InvalidInput(format!("member {id} not in configuration")));
        }
        let listener = Self::bind(&config, id)?;
        let now = clock.now();
        let state = NodeState::new(id, config.clone(), state_machine, now);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            clock,
            listener: Mutex::new(listener),
            disposed: AtomicBool::new(false),
        });

        let connections = Self::spawn_connections(&config, id, 0, &shared)?;
        shared.with_state(|state| state.connections = connections)?;

        let mut threads = Vec::new();
        {
            let shared = shared.clone();
            threads.push(std::thread::spawn(move || Self::run_consensus_loop(&shared)));
        }
        {
            let shared = shared.clone();
            threads.push(std::thread::spawn(move || Self::run_acceptor(&shared)));
        }

        info!("started node {id} in a cluster of {}", config.size());
        Ok(Self { shared, threads: Mutex::new(threads) })
    }

    /// Binds the member's own listen address, in non-blocking mode so the
    /// accept loop can terminate cooperatively.
    fn bind(config: &Configuration, id: MemberId) -> Result<TcpListener> {
        let address = config.resolver(id)?.resolve()?;
        let listener = TcpListener::bind(address.to_socket_addr()?)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Creates the connection for every peer slot.
    fn spawn_connections(
        config: &Configuration,
        id: MemberId,
        epoch: u64,
        shared: &Arc<Shared>,
    ) -> Result<HashMap<MemberId, Arc<Connection>>> {
        let mut connections = HashMap::new();
        for peer in (0..config.size() as MemberId).filter(|peer| *peer != id) {
            let resolver = config.resolver(peer)?;
            let inbound = shared.clone() as Arc<dyn Inbound>;
            connections.insert(peer, Connection::spawn(peer, id, epoch, resolver, inbound));
        }
        Ok(connections)
    }

    /// Drives timers: ticks the state machine at a fixed interval until the
    /// node is disposed.
    fn run_consensus_loop(shared: &Arc<Shared>) {
        while !shared.is_disposed() {
            std::thread::sleep(TICK_INTERVAL);
            let now = shared.clock.now();
            if let Err(err) = shared.with_state(|state| state.tick(now)) {
                error!("consensus tick failed: {err}");
            }
        }
    }

    /// Accepts inbound peer connections and routes each to its slot by the
    /// handshake index.
    fn run_acceptor(shared: &Arc<Shared>) {
        while !shared.is_disposed() {
            let accepted = shared.listener.lock().accept();
            match accepted {
                Ok((socket, _)) => {
                    if let Err(err) = Self::route_accepted(shared, socket) {
                        warn!("rejecting inbound connection: {err}");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    error!("accepting connection failed: {err}");
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    /// Reads the 4-byte member-index handshake from a fresh socket and hands
    /// the session to the matching passive connection.
    fn route_accepted(shared: &Arc<Shared>, mut socket: TcpStream) -> Result<()> {
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let mut handshake = [0u8; 4];
        socket.read_exact(&mut handshake)?;
        socket.set_read_timeout(None)?;
        let from = MemberId::from_le_bytes(handshake);

        let connection = {
            let state = shared.lock_state()?;
            if from == state.id || !state.config.contains(from) {
                return Err(Error::InvalidInput(format!("handshake from unknown member {from}")));
            }
            state.connections.get(&from).cloned()
        };
        let Some(connection) = connection else {
            return Err(Error::Internal(format!("no connection slot for member {from}")));
        };
        if connection.is_active() {
            return Err(Error::InvalidInput(format!(
                "inbound connection from member {from}, whom we dial"
            )));
        }
        connection.accept_session(socket, shared.clone());
        Ok(())
    }

    /// Submits an operation for replication. Fire and forget: the operation
    /// is eventually applied via the state machine callback on every
    /// replica, or dropped if the cluster cannot reach consensus. An empty
    /// operation is accepted as a no-op.
    pub fn submit(&self, operation: Vec<u8>) {
        if operation.is_empty() {
            return;
        }
        let now = self.shared.clock.now();
        if let Err(err) = self.shared.with_state(|state| state.submit(operation, now)) {
            error!("submitting operation failed: {err}");
        }
    }

    /// Replaces the cluster membership and this node's index, tearing down
    /// and rebuilding every peer connection. The log and term are retained.
    pub fn join(&self, config: Configuration, id: MemberId) -> Result<()> {
        if !config.contains(id) {
            return Err(Error::InvalidInput(format!("member {id} not in configuration")));
        }
        let listener = Self::bind(&config, id)?;
        let now = self.shared.clock.now();
        let (epoch, old_connections) = self.shared.with_state(|state| {
            state.epoch += 1;
            state.id = id;
            state.config = config.clone();
            state.leader = None;
            state.voted_for = None;
            let election_deadline = now + random_election_timeout();
            state.role = Role::Follower(Follower { election_deadline });
            (state.epoch, std::mem::take(&mut state.connections))
        })?;
        // Dispose outside the lock: their readers may be waiting for it.
        for connection in old_connections.values() {
            connection.dispose();
        }
        *self.shared.listener.lock() = listener;
        let connections = Self::spawn_connections(&config, id, epoch, &self.shared)?;
        self.shared.with_state(|state| state.connections = connections)?;
        info!("joined configuration of {} members as member {id}", config.size());
        Ok(())
    }

    /// Whether this node currently leads its term.
    pub fn is_leader(&self) -> bool {
        matches!(self.shared.state.lock().role, Role::Leader(_))
    }

    /// The current term.
    pub fn term(&self) -> Term {
        self.shared.state.lock().term
    }

    /// The member believed to lead the current term, if known.
    pub fn leader(&self) -> Option<MemberId> {
        self.shared.state.lock().leader
    }

    /// The highest committed log index.
    pub fn commit_index(&self) -> Index {
        self.shared.state.lock().log.commit_index()
    }

    /// The number of entries in the local log.
    pub fn log_size(&self) -> Index {
        self.shared.state.lock().log.size()
    }

    /// The number of peer connections with a live session.
    pub fn active_connections(&self) -> usize {
        self.shared.state.lock().connections.values().filter(|c| c.has_session()).count()
    }

    /// Whether every configured peer has a live session.
    pub fn is_fully_connected(&self) -> bool {
        let state = self.shared.state.lock();
        state.connections.values().filter(|c| c.has_session()).count()
            == state.config.size().saturating_sub(1)
    }

    /// A snapshot of the node's health.
    pub fn status(&self) -> Status {
        self.shared.state.lock().status()
    }

    /// The (index, term) pairs of all committed entries, for cross-node
    /// integrity checks.
    pub fn committed_entries(&self) -> Vec<(Index, Term)> {
        self.shared.state.lock().committed_entries()
    }

    /// Stops the node: every loop exits cooperatively, every thread is
    /// joined, and no message is processed after teardown begins.
    pub fn shutdown(self) -> Result<()> {
        self.dispose()
    }

    fn dispose(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Stop the acceptor and consensus loop first, so no session can be
        // routed to a connection mid-teardown.
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        let connections = self.shared.with_state(|state| std::mem::take(&mut state.connections))?;
        for connection in connections.values() {
            connection.dispose();
        }
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            error!("node shutdown failed: {err}");
        }
    }
}
