//! Distributed consensus for the Shard simulation cluster.
//!
//! Each shard region runs a cluster of simulation nodes that must agree on an
//! ordered log of operations. This module implements the consensus engine the
//! cluster uses to get there: leader election, log replication, and
//! commit-index advancement in the style of Raft (see
//! <https://raft.github.io/raft.pdf>), over raw TCP links between configured
//! members, with no external consensus library.
//!
//! The engine is deliberately small. Time is divided into terms with at most
//! one leader per term. Nodes start as leaderless followers; a follower that
//! hears nothing from a leader within a randomized election timeout becomes a
//! candidate, increments its term, and solicits votes. A candidate with votes
//! from a strict majority becomes leader and asserts itself with periodic
//! heartbeats (`Append` messages, with or without entries). The leader
//! appends submitted operations to its log and replicates them to followers;
//! once an index is replicated on a strict majority it is committed, and
//! every node applies the committed range to its host state machine exactly
//! once, in index order.
//!
//! Structure:
//!
//! * [`Node`]: the host-facing handle and the state machine driving the
//!   Follower/Candidate/Leader roles. All consensus state lives behind one
//!   exclusive lock; inbound messages and timer ticks are serialized through
//!   it, which linearizes every safety-relevant transition.
//! * [`Log`]: the replicated in-memory log. Committed entries are immutable;
//!   truncating an executed entry is a protocol bug and panics.
//! * [`Message`]: the closed set of wire messages, carried in a term-tagged
//!   [`Envelope`] and screened by a single term-filter gate.
//! * `connection`: one reconnecting transport link per configured peer, with
//!   independent reader and writer threads. The higher-indexed member dials
//!   the lower-indexed one; accepted sockets are routed to their peer slot by
//!   a 4-byte handshake.
//! * [`Configuration`]: the ordered member list, with late-bound address
//!   resolution per member.
//!
//! Out of scope by design: durable log storage, snapshots and log
//! compaction, joint-consensus membership changes (only the wholesale
//! [`Node::join`] reconfiguration hook), and Byzantine faults -- members are
//! assumed to fail by crashing.

mod address;
mod clock;
mod connection;
pub mod integrity;
mod log;
mod message;
mod node;

pub use address::{Address, AddressResolver, Configuration};
pub use clock::{Clock, ManualClock, SystemClock};
pub use log::{Entry, Index, Log};
pub use message::{Envelope, Message};
pub use node::{MemberId, Node, StateMachine, Status, Term};

use std::time::Duration;

/// The interval between consensus loop ticks. Each tick polls the election,
/// heartbeat, and retransmission deadlines.
pub const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// The interval between leader heartbeats. Followers use heartbeat receipt as
/// the liveness signal that postpones elections.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// The election timeout range in milliseconds. Randomized per election to
/// avoid repeated split votes.
pub(crate) const ELECTION_TIMEOUT_RANGE: std::ops::Range<u64> = 150..500;

/// How long a leader waits for an append confirmation before resending
/// entries to a peer.
pub(crate) const APPEND_RESEND_TIMEOUT: Duration = Duration::from_millis(250);

/// A connection is considered alive if bytes arrived within this window.
/// Passive sessions that go silent for longer are disposed, freeing the slot
/// for a fresh accept.
pub(crate) const CONNECTION_ALIVE_WINDOW: Duration = Duration::from_secs(2);

/// The delay between redial attempts on an actively-dialed connection.
pub(crate) const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// The timeout for a single outbound connect attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The timeout for reading the 4-byte member-index handshake from a freshly
/// accepted socket.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// The bounded wait for the node-wide lock. Exceeding it means a deadlock or
/// a grossly misconfigured host, and is surfaced as a fatal internal error.
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// The capacity of each connection's outbound queue. When full, messages are
/// discarded; retransmission timers recover the lost traffic.
pub(crate) const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// The polling interval of the non-blocking accept loop.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
