//! Paxos -- acceptor-side handling of Prepare/Accept/Commit.

use super::instance::InstanceTable;
use super::messages::PeerReply;
use super::{Ballot, InstanceId, ReplicaId};

// Acceptor-side handlers. They only touch the owned table, and are invoked
// identically for self-calls and remote calls.
impl<V: Clone> InstanceTable<V> {
    /// Handler of Prepare message. Also absorbs the sender's piggybacked
    /// done progress and garbage-collects accordingly.
    pub(crate) fn handle_prepare(
        &mut self,
        inst: InstanceId,
        ballot: Ballot,
        done: Option<InstanceId>,
        sender: ReplicaId,
    ) -> PeerReply<V> {
        if self.update_done(sender, done) {
            self.collect_garbage();
        }

        let instance = self.get_or_create(inst);
        if Some(ballot) > instance.promised {
            instance.promised = Some(ballot);
            PeerReply::Prepare {
                ok: true,
                promised: instance.promised,
                accepted: instance.accepted,
                value: instance.value.clone(),
            }
        } else {
            PeerReply::Prepare {
                ok: false,
                promised: instance.promised,
                accepted: None,
                value: None,
            }
        }
    }

    /// Handler of Accept message.
    pub(crate) fn handle_accept(
        &mut self,
        inst: InstanceId,
        ballot: Ballot,
        value: V,
    ) -> PeerReply<V> {
        let instance = self.get_or_create(inst);
        if Some(ballot) >= instance.promised {
            instance.promised = Some(ballot);
            instance.accepted = Some(ballot);
            // a decided value never changes again
            if !instance.committed {
                instance.value = Some(value);
            }
            PeerReply::Accept {
                ok: true,
                promised: instance.promised,
            }
        } else {
            PeerReply::Accept {
                ok: false,
                promised: instance.promised,
            }
        }
    }

    /// Handler of Commit message. Returns true if this newly marks the
    /// instance as committed.
    pub(crate) fn handle_commit(
        &mut self,
        inst: InstanceId,
        value: V,
    ) -> (PeerReply<V>, bool) {
        let instance = self.get_or_create(inst);
        let newly = !instance.committed;
        if newly {
            instance.value = Some(value);
            instance.committed = true;
        }
        (PeerReply::Commit { ok: true }, newly)
    }
}
