//! Paxos -- per-instance acceptor state and the peer progress table.

use std::collections::BTreeMap;

use super::{Ballot, InstanceId, ReplicaId};

/// Acceptance state of one Paxos instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Instance<V> {
    /// Highest ballot for which I have accepted a value.
    pub(crate) accepted: Option<Ballot>,

    /// Highest ballot I have promised not to violate.
    pub(crate) promised: Option<Ballot>,

    /// True once I learn the instance reached quorum agreement.
    pub(crate) committed: bool,

    /// Accepted (or decided, if committed) value.
    pub(crate) value: Option<V>,
}

impl<V> Default for Instance<V> {
    fn default() -> Self {
        Instance {
            accepted: None,
            promised: None,
            committed: false,
            value: None,
        }
    }
}

/// Owned table of instances keyed by instance ID, together with the peer
/// progress table that drives garbage collection.
#[derive(Debug)]
pub(crate) struct InstanceTable<V> {
    /// My replica ID.
    me: ReplicaId,

    /// Map from instance ID -> instance state. Entries are created lazily
    /// upon first reference.
    insts: BTreeMap<InstanceId, Instance<V>>,

    /// Map from peer ID -> the highest instance that peer has declared done.
    /// `None` means nothing declared yet.
    done: Vec<Option<InstanceId>>,
}

impl<V> InstanceTable<V> {
    /// Creates an empty table for a cluster of `population` peers.
    pub(crate) fn new(me: ReplicaId, population: u8) -> Self {
        InstanceTable {
            me,
            insts: BTreeMap::new(),
            done: vec![None; population as usize],
        }
    }

    /// Gets the instance at given ID, creating a fresh one if absent.
    pub(crate) fn get_or_create(&mut self, inst: InstanceId) -> &mut Instance<V> {
        self.insts.entry(inst).or_default()
    }

    /// Gets the instance at given ID if I hold any record of it.
    pub(crate) fn get(&self, inst: InstanceId) -> Option<&Instance<V>> {
        self.insts.get(&inst)
    }

    /// Returns the decided value of given instance if known committed.
    pub(crate) fn committed_value(&self, inst: InstanceId) -> Option<&V> {
        self.insts
            .get(&inst)
            .filter(|i| i.committed)
            .and_then(|i| i.value.as_ref())
    }

    /// Highest instance ID I hold any record of.
    pub(crate) fn max_known(&self) -> Option<InstanceId> {
        self.insts.keys().next_back().copied()
    }

    /// My own done progress.
    pub(crate) fn my_done(&self) -> Option<InstanceId> {
        self.done[self.me as usize]
    }

    /// Raises the done progress of given peer; never moves it backwards.
    /// Returns false if the peer ID is out of range.
    pub(crate) fn update_done(
        &mut self,
        peer: ReplicaId,
        done: Option<InstanceId>,
    ) -> bool {
        match self.done.get_mut(peer as usize) {
            Some(entry) => {
                if done > *entry {
                    *entry = done;
                }
                true
            }
            None => false,
        }
    }

    /// The minimum live instance ID: every instance below it has been
    /// declared done by all peers.
    pub(crate) fn min_live(&self) -> InstanceId {
        match self.done.iter().min() {
            Some(Some(min_done)) => min_done + 1,
            _ => 0,
        }
    }

    /// Forgets every instance below the minimum live instance. Returns the
    /// number of instances released.
    pub(crate) fn collect_garbage(&mut self) -> usize {
        let min_live = self.min_live();
        let before = self.insts.len();
        self.insts = self.insts.split_off(&min_live);
        before - self.insts.len()
    }

    /// Number of instance records currently held.
    pub(crate) fn len(&self) -> usize {
        self.insts.len()
    }
}

#[cfg(test)]
mod instance_tests {
    use super::*;

    #[test]
    fn lazy_default_instance() {
        let mut table: InstanceTable<String> = InstanceTable::new(0, 3);
        assert!(table.get(4).is_none());
        assert_eq!(*table.get_or_create(4), Instance::default());
        assert!(table.get(4).is_some());
        assert_eq!(table.max_known(), Some(4));
        assert!(table.committed_value(4).is_none());
    }

    #[test]
    fn done_progress_monotonic() {
        let mut table: InstanceTable<String> = InstanceTable::new(1, 3);
        assert_eq!(table.my_done(), None);
        assert!(table.update_done(1, Some(5)));
        assert!(table.update_done(1, Some(2)));
        assert!(table.update_done(1, None));
        assert_eq!(table.my_done(), Some(5));
        assert!(!table.update_done(3, Some(1)));
    }

    #[test]
    fn min_live_needs_all_peers() {
        let mut table: InstanceTable<String> = InstanceTable::new(0, 3);
        assert_eq!(table.min_live(), 0);
        table.update_done(0, Some(4));
        table.update_done(1, Some(6));
        assert_eq!(table.min_live(), 0);
        table.update_done(2, Some(3));
        assert_eq!(table.min_live(), 4);
        table.update_done(2, Some(9));
        assert_eq!(table.min_live(), 5);
    }

    #[test]
    fn collect_below_boundary() {
        let mut table: InstanceTable<String> = InstanceTable::new(0, 2);
        for inst in 0..8 {
            let i = table.get_or_create(inst);
            i.committed = true;
            i.value = Some(format!("v{}", inst));
        }
        assert_eq!(table.collect_garbage(), 0);
        table.update_done(0, Some(5));
        table.update_done(1, Some(2));
        assert_eq!(table.collect_garbage(), 3);
        assert_eq!(table.len(), 5);
        assert!(table.get(2).is_none());
        assert_eq!(table.committed_value(3), Some(&"v3".to_string()));
        assert_eq!(table.max_known(), Some(7));
    }
}
