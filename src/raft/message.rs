use super::{Entry, Index, NodeID, Term};
use crate::error::Result;

use serde::{Deserialize, Serialize};

/// A message passed between replicas and clients. Every message shares the
/// same envelope; the payload is a closed sum discriminated by the wire's
/// "type" field, so dispatch over kinds is exhaustive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub src: NodeID,
    /// The recipient, or BROADCAST.
    pub dst: NodeID,
    /// The sender's believed leader, or BROADCAST if unknown.
    pub leader: NodeID,
    /// The message payload.
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Decodes an envelope from a single JSON wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encodes the envelope as a single JSON wire frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// A client read request.
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },

    /// A client write request.
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },

    /// Tells a client which replica it should be talking to. The envelope's
    /// leader field carries the redirect target.
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// A successful client response. Reads carry the value (empty string for
    /// unknown keys); writes carry no value.
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Candidates solicit votes from all peers when campaigning.
    RequestVote {
        term: Term,
        #[serde(rename = "candidateID")]
        candidate_id: NodeID,
        #[serde(rename = "lastLogIndex")]
        last_index: Index,
        #[serde(rename = "lastLogTerm")]
        last_term: Term,
    },

    /// A vote response. The voter's own log position travels along, so a
    /// rejected candidate can tell a split vote between equals from a loss.
    Vote {
        term: Term,
        #[serde(rename = "lastLogIndex")]
        last_index: Index,
        #[serde(rename = "lastLogTerm")]
        last_term: Term,
        #[serde(rename = "voteGranted")]
        granted: bool,
    },

    /// Leaders replicate log entries to followers. An empty entries list is a
    /// heartbeat, which only suppresses follower election timeouts.
    AppendEntry {
        term: Term,
        #[serde(rename = "prevLogIndex")]
        prev_index: Index,
        #[serde(rename = "prevLogTerm")]
        prev_term: Term,
        #[serde(rename = "leaderCommit")]
        leader_commit: Index,
        #[serde(rename = "leaderLastApplied")]
        leader_applied: Index,
        entries: Vec<Entry>,
    },

    /// A follower's response to an append. On success, last_index/last_term
    /// name the follower's new log head; on failure they are cursor hints the
    /// leader rewinds its next_index to.
    Confirmation {
        term: Term,
        success: bool,
        #[serde(rename = "followerPrevLastIndex")]
        last_index: Index,
        #[serde(rename = "followerPrevLastTerm")]
        last_term: Term,
    },
}

impl Message {
    /// Returns true for the peer protocol messages that defer a replica's
    /// election timeout when seen.
    pub fn resets_timer(&self) -> bool {
        matches!(
            self,
            Message::AppendEntry { .. } | Message::RequestVote { .. } | Message::Vote { .. }
        )
    }
}
