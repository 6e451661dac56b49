//! Paxos -- peer-peer wire messages.

use super::{Ballot, InstanceId, ReplicaId};

use serde::{Deserialize, Serialize};

/// Peer-peer request message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMsg<V> {
    /// Prepare message from proposer to all peers.
    Prepare {
        inst: InstanceId,
        ballot: Ballot,
        /// Sender's own done progress, piggybacked so that peers eagerly
        /// learn each other's GC boundary.
        done: Option<InstanceId>,
        sender: ReplicaId,
    },

    /// Accept message from proposer to all peers.
    Accept {
        inst: InstanceId,
        ballot: Ballot,
        value: V,
    },

    /// Best-effort notification of an already-decided value.
    Commit { inst: InstanceId, value: V },
}

/// Peer-peer reply message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply<V> {
    /// Prepare reply. On `ok`, carries the acceptor's highest accepted
    /// ballot and value; otherwise `promised` tells the proposer what it
    /// has to beat.
    Prepare {
        ok: bool,
        promised: Option<Ballot>,
        accepted: Option<Ballot>,
        value: Option<V>,
    },

    /// Accept reply.
    Accept { ok: bool, promised: Option<Ballot> },

    /// Commit reply.
    Commit { ok: bool },
}
