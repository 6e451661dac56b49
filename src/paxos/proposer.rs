//! Paxos -- proposer-side round loop.

use std::sync::Arc;

use super::messages::{PeerMsg, PeerReply};
use super::{Ballot, InstanceId, PaxosPeer, PaxosValue, ReplicaId};

use crate::utils::KikuError;

use fixedbitset::FixedBitSet;

use futures::future::join_all;

use rand::Rng;

use tokio::time::{self, Duration};

/// Result of one Prepare-Accept-Commit round.
#[derive(Debug, PartialEq, Eq)]
enum RoundOutcome {
    /// Value decided and Commit broadcast.
    Committed,

    /// Failed to gather a quorum in some phase; `max_seen` is the highest
    /// promised ballot reported by any rejecting peer.
    Rejected { max_seen: Option<Ballot> },
}

impl<V: PaxosValue> PaxosPeer<V> {
    /// Composes my ballot number for given round. Ballots of different
    /// peers never collide.
    fn make_ballot(&self, round: u64) -> Ballot {
        round * (self.population as Ballot) + (self.me as Ballot)
    }

    /// Drives given instance to agreement, retrying rounds with backoff
    /// until the instance is known committed, forgotten, or I am shut down.
    pub(super) async fn run_proposal(self: Arc<Self>, inst: InstanceId, value: V) {
        let _guard = self.propose_lock.lock().await;
        let mut round: u64 = 0;

        loop {
            if self.is_closed() {
                pf_debug!(self.me; "proposal for inst {} abandoned on shutdown",
                                   inst);
                return;
            }
            {
                let table = self.table.lock().await;
                if inst < table.min_live() || table.committed_value(inst).is_some()
                {
                    return;
                }
            }

            let ballot = self.make_ballot(round);
            match self.try_round(inst, ballot, &value).await {
                RoundOutcome::Committed => {
                    pf_debug!(self.me; "proposal for inst {} committed bal {}",
                                       inst, ballot);
                    return;
                }
                RoundOutcome::Rejected { max_seen } => {
                    pf_trace!(self.me; "round for inst {} bal {} rejected, max seen {:?}",
                                       inst, ballot, max_seen);
                    round += 1;
                    if let Some(b) = max_seen {
                        round = round.max(b / (self.population as Ballot) + 1);
                    }
                }
            }

            let jitter = if self.config.backoff_jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms)
            } else {
                0
            };
            time::sleep(Duration::from_millis(self.config.backoff_ms + jitter))
                .await;
        }
    }

    /// Runs one round with given ballot.
    async fn try_round(
        &self,
        inst: InstanceId,
        ballot: Ballot,
        value: &V,
    ) -> RoundOutcome {
        let mut max_seen: Option<Ballot> = None;

        // Prepare phase
        let done = self.table.lock().await.my_done();
        let replies = self
            .broadcast(PeerMsg::Prepare {
                inst,
                ballot,
                done,
                sender: self.me,
            })
            .await;

        let mut prepare_acks =
            FixedBitSet::with_capacity(self.population as usize);
        let mut highest: Option<(Ballot, V)> = None;
        for (peer, reply) in replies {
            match reply {
                Some(PeerReply::Prepare {
                    ok: true,
                    accepted,
                    value: Some(v),
                    ..
                }) => {
                    prepare_acks.insert(peer as usize);
                    if let Some(a) = accepted {
                        if highest.as_ref().map_or(true, |(hb, _)| a > *hb) {
                            highest = Some((a, v));
                        }
                    }
                }
                Some(PeerReply::Prepare { ok: true, .. }) => {
                    prepare_acks.insert(peer as usize);
                }
                Some(PeerReply::Prepare {
                    ok: false, promised, ..
                }) => {
                    max_seen = max_seen.max(promised);
                }
                _ => {}
            }
        }
        if prepare_acks.count_ones(..) < self.quorum_cnt as usize {
            return RoundOutcome::Rejected { max_seen };
        }

        // carry forward the value accepted at the highest ballot, if any
        let value = match highest {
            Some((_, v)) => v,
            None => value.clone(),
        };

        // Accept phase
        let replies = self
            .broadcast(PeerMsg::Accept {
                inst,
                ballot,
                value: value.clone(),
            })
            .await;

        let mut accept_acks =
            FixedBitSet::with_capacity(self.population as usize);
        for (peer, reply) in replies {
            match reply {
                Some(PeerReply::Accept { ok: true, .. }) => {
                    accept_acks.insert(peer as usize);
                }
                Some(PeerReply::Accept {
                    ok: false, promised, ..
                }) => {
                    max_seen = max_seen.max(promised);
                }
                _ => {}
            }
        }
        if accept_acks.count_ones(..) < self.quorum_cnt as usize {
            return RoundOutcome::Rejected { max_seen };
        }

        // Commit phase, best-effort
        let replies = self.broadcast(PeerMsg::Commit { inst, value }).await;
        let reached = replies.iter().filter(|(_, r)| r.is_some()).count();
        if reached < self.population as usize {
            pf_debug!(self.me; "commit for inst {} reached {}/{} peers",
                               inst, reached, self.population);
        }
        RoundOutcome::Committed
    }

    /// Sends a message to every peer (including myself) concurrently and
    /// collects the replies, `None` for peers that failed to respond.
    async fn broadcast(
        &self,
        msg: PeerMsg<V>,
    ) -> Vec<(ReplicaId, Option<PeerReply<V>>)> {
        let calls = (0..self.population).map(|peer| {
            let msg = msg.clone();
            async move {
                let reply = match self.call_peer(peer, msg).await {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        pf_trace!(self.me; "call to {} failed: {}", peer, e);
                        None
                    }
                };
                (peer, reply)
            }
        });
        join_all(calls).await
    }

    /// Calls one peer. A call to myself is handled locally; calls to others
    /// go through the transport and are bounded by the RPC timeout.
    async fn call_peer(
        &self,
        peer: ReplicaId,
        msg: PeerMsg<V>,
    ) -> Result<PeerReply<V>, KikuError> {
        if peer == self.me {
            if self.is_closed() {
                return Err(KikuError::msg("peer closed"));
            }
            return Ok(self.handle_msg(msg).await);
        }

        time::timeout(
            Duration::from_millis(self.config.rpc_timeout_ms),
            self.transport.call(peer, msg),
        )
        .await?
    }
}
