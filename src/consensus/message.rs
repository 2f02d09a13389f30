//! The wire protocol between cluster members.
//!
//! Every message travels in an [`Envelope`] tagged with the sender's current
//! term. The sender's identity is not carried in the envelope: each
//! connection is bound to a configured peer slot at handshake time, so the
//! transport knows who is talking.
//!
//! All inbound messages pass through a single term-filter [`gate`] before any
//! protocol logic runs. Stale-term messages never mutate node state; they at
//! most produce a type-specific rejection so the sender can catch up.

use super::log::{Entry, Index};
use super::node::Term;

use serde::{Deserialize, Serialize};

/// A wire envelope: the sender's current term and the message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's term when the message was sent.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A protocol message. The set is closed: every message a member can send is
/// one of these five variants, and each carries enough log-offset metadata to
/// be processed without further queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leader -> follower: replicate entries and assert leadership. An empty
    /// entry list is a heartbeat.
    Append {
        /// The index of the entry immediately preceding `entries`.
        prev_index: Index,
        /// The term of the entry at `prev_index`.
        prev_term: Term,
        /// The entries to replicate, in index order from `prev_index + 1`.
        entries: Vec<Entry>,
        /// The leader's commit index, bounding how far the follower may
        /// advance its own.
        leader_commit: Index,
    },

    /// Follower -> leader: the outcome of an `Append`.
    AppendResponse {
        /// Whether the entries were applied to the follower's log. False
        /// forces the leader to back up and resend from an earlier point.
        succeeded: bool,
        /// The follower's log size after processing.
        last_index: Index,
        /// The follower's commit index after processing.
        commit_index: Index,
    },

    /// Candidate -> all: solicit a vote for the candidate's current term.
    Campaign {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Voter -> candidate: grant or reject the vote.
    CampaignResponse {
        /// Whether the vote was granted. A member grants at most one vote
        /// per term.
        granted: bool,
    },

    /// Non-leader -> leader: forward a host operation for replication.
    Submit {
        /// The opaque operation to append to the replicated log.
        operation: Vec<u8>,
    },
}

/// The verdict of the term-filter gate.
#[derive(Clone, Debug, PartialEq)]
pub enum Gate {
    /// The message is at the receiver's term: process it.
    Process,
    /// The message is from a future term: adopt that term (becoming a
    /// leaderless follower), then process the message in it.
    AdoptTerm,
    /// The message is from a past term: do not touch any state; at most send
    /// the given rejection back.
    Stale(Option<Message>),
}

/// Screens an inbound envelope against the receiver's current term. This is
/// the single gate all inbound messages pass before protocol logic; it
/// guarantees stale-term traffic can never mutate log or election state.
/// `last_index` and `commit_index` describe the receiver's log, for stale
/// append rejections.
pub fn gate(current: Term, envelope: &Envelope, last_index: Index, commit_index: Index) -> Gate {
    match envelope.term.cmp(&current) {
        std::cmp::Ordering::Less => {
            Gate::Stale(stale_reply(&envelope.message, last_index, commit_index))
        }
        std::cmp::Ordering::Equal => Gate::Process,
        std::cmp::Ordering::Greater => Gate::AdoptTerm,
    }
}

/// The type-specific reply to a stale-term message, if any. Stale appends and
/// campaigns are rejected so the sender learns it is behind; everything else
/// is dropped silently.
fn stale_reply(message: &Message, last_index: Index, commit_index: Index) -> Option<Message> {
    match message {
        Message::Append { .. } => {
            Some(Message::AppendResponse { succeeded: false, last_index, commit_index })
        }
        Message::Campaign { .. } => Some(Message::CampaignResponse { granted: false }),
        Message::AppendResponse { .. } | Message::CampaignResponse { .. } | Message::Submit { .. } => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn envelope(term: Term, message: Message) -> Envelope {
        Envelope { term, message }
    }

    #[test]
    fn gate_verdicts() {
        let heartbeat =
            Message::Append { prev_index: 3, prev_term: 2, entries: vec![], leader_commit: 3 };

        assert_eq!(gate(2, &envelope(2, heartbeat.clone()), 3, 1), Gate::Process);
        assert_eq!(gate(2, &envelope(5, heartbeat.clone()), 3, 1), Gate::AdoptTerm);
        assert_eq!(
            gate(2, &envelope(1, heartbeat), 3, 1),
            Gate::Stale(Some(Message::AppendResponse {
                succeeded: false,
                last_index: 3,
                commit_index: 1
            }))
        );
    }

    #[test]
    fn stale_replies_by_type() {
        let campaign = Message::Campaign { last_index: 7, last_term: 1 };
        assert_eq!(
            gate(3, &envelope(1, campaign), 0, 0),
            Gate::Stale(Some(Message::CampaignResponse { granted: false }))
        );

        // Responses and submissions from past terms are dropped outright.
        for message in [
            Message::AppendResponse { succeeded: true, last_index: 1, commit_index: 0 },
            Message::CampaignResponse { granted: true },
            Message::Submit { operation: b"op".to_vec() },
        ] {
            assert_eq!(gate(3, &envelope(2, message), 0, 0), Gate::Stale(None));
        }
    }
}
