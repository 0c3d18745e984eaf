// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The chain of [`TransactionRange`]s shared by all viewers of a database.

pub mod errors;
pub mod transaction_range;

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

pub use self::errors::InvalidRange;
pub use self::transaction_range::TransactionRange;
use crate::Oid;
use crate::OidTidMap;
use crate::Tid;

/// A range that may be linked into several chains at once.
pub type SharedRange = Arc<RwLock<TransactionRange>>;

/// An ordered chain of [`TransactionRange`], newest first.
///
/// A chain is published as `Arc<ObjectIndex>` and never changes its list of ranges.
/// Extending it builds a new chain that shares every existing range, so a viewer holding
/// an older chain keeps seeing the state it polled.
///
/// Ranges are strictly ordered by decreasing `highest_visible_tid`.
/// Two adjacent ranges may leave a gap in tid space, or their complete intervals may
/// overlap.
#[derive(Debug)]
pub struct ObjectIndex {
    ranges: Vec<SharedRange>,
}

impl ObjectIndex {
    /// Create a single-range chain at `highest_visible_tid` that makes no completeness claim.
    pub fn new(
        highest_visible_tid: Tid,
        data: impl IntoIterator<Item = (Oid, Tid)>,
    ) -> Result<Arc<Self>, InvalidRange> {
        let range = TransactionRange::new(highest_visible_tid, None, data)?;
        Ok(Arc::new(Self {
            ranges: vec![Arc::new(RwLock::new(range))],
        }))
    }

    /// Build a chain from ranges already ordered newest first.
    pub(crate) fn from_ranges(ranges: Vec<SharedRange>) -> Arc<Self> {
        debug_assert!(!ranges.is_empty());
        Arc::new(Self { ranges })
    }

    pub fn depth(&self) -> usize {
        self.ranges.len()
    }

    pub fn highest_visible_tid(&self) -> Tid {
        self.ranges[0].read().highest_visible_tid()
    }

    pub fn maximum_highest_visible_tid(&self) -> Tid {
        self.highest_visible_tid()
    }

    pub fn minimum_highest_visible_tid(&self) -> Tid {
        self.get_oldest_transaction().read().highest_visible_tid()
    }

    /// The oldest tid since which some range of this chain claims completeness.
    pub fn complete_since_tid(&self) -> Option<Tid> {
        self.ranges
            .iter()
            .rev()
            .find_map(|r| r.read().complete_since_tid())
    }

    pub fn get_newest_transaction(&self) -> &SharedRange {
        &self.ranges[0]
    }

    pub fn get_oldest_transaction(&self) -> &SharedRange {
        &self.ranges[self.ranges.len() - 1]
    }

    /// Ranges from position `ix` (0 is the newest) to the oldest.
    pub fn get_transactions_from(&self, ix: usize) -> &[SharedRange] {
        &self.ranges[ix.min(self.ranges.len())..]
    }

    /// Look up an oid: the newest range that knows about it wins.
    pub fn get(&self, oid: Oid) -> Option<Tid> {
        self.ranges.iter().find_map(|r| r.read().get(oid))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.get(oid).is_some()
    }

    /// Record what a reader loaded at this chain's tid.
    ///
    /// Tids this chain can not see are silently discarded.
    pub fn insert(&self, oid: Oid, tid: Tid) -> bool {
        self.ranges[0].write().insert(oid, tid)
    }

    /// Flatten the chain into a single map, newer ranges shadowing older ones.
    pub fn as_dict(&self) -> OidTidMap {
        let mut res = OidTidMap::new();
        for r in self.ranges.iter().rev() {
            res.extend(r.read().items());
        }
        res
    }

    /// Fold the result of a poll into this chain.
    ///
    /// - Polling the same tid folds `changes` into the newest range and returns this very
    ///   chain. Empty `changes` never strengthen the completeness claim.
    /// - Polling a newer tid returns a new chain with a new range in front, this chain is
    ///   left as it is.
    pub fn with_polled_changes(
        self: &Arc<Self>,
        highest_visible_tid: Tid,
        complete_since_tid: Tid,
        changes: impl IntoIterator<Item = (Oid, Tid)>,
    ) -> Result<Arc<Self>, InvalidRange> {
        let current = self.highest_visible_tid();

        if highest_visible_tid < current {
            return Err(InvalidRange::Regressed {
                polled: highest_visible_tid,
                current,
            });
        }

        let mut changes = changes.into_iter().peekable();

        if highest_visible_tid == current {
            if changes.peek().is_none() {
                return Ok(self.clone());
            }

            let polled =
                TransactionRange::new(highest_visible_tid, Some(complete_since_tid), changes)?;

            let changed = self.ranges[0].write().merge_same_tid(&polled)?;
            debug!(
                "ObjectIndex::with_polled_changes: merged same tid={}, changed={}",
                highest_visible_tid, changed
            );
            return Ok(self.clone());
        }

        let polled = TransactionRange::new(highest_visible_tid, Some(complete_since_tid), changes)?;

        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        ranges.push(Arc::new(RwLock::new(polled)));
        ranges.extend(self.ranges.iter().cloned());

        debug!(
            "ObjectIndex::with_polled_changes: new head tid={}, complete_since={}, depth={}",
            highest_visible_tid,
            complete_since_tid,
            ranges.len()
        );

        Ok(Arc::new(Self { ranges }))
    }

    /// Whether this chain records every change in `(tid, highest_visible_tid]`.
    pub fn is_complete_since(&self, tid: Tid) -> bool {
        let mut low = self.highest_visible_tid();

        for r in self.ranges.iter() {
            if low <= tid {
                return true;
            }

            let r = r.read();
            if r.highest_visible_tid() < low {
                // A gap nobody polled.
                return false;
            }
            if let Some(since) = r.complete_since_tid() {
                low = low.min(since);
            }
        }

        low <= tid
    }

    /// Every oid changed in `(tid, highest_visible_tid]`, with the tid it changed at.
    ///
    /// Returns `None` if this chain can not prove it knows all of them.
    pub fn collect_changes_after(&self, tid: Tid) -> Option<OidTidMap> {
        if !self.is_complete_since(tid) {
            return None;
        }

        let mut changes = OidTidMap::new();
        for r in self.ranges.iter().rev() {
            let r = r.read();
            if r.highest_visible_tid() <= tid {
                continue;
            }
            changes.extend(r.items().filter(|(_oid, t)| *t > tid));
        }
        Some(changes)
    }

    /// Position of the newest range a viewer at `tid` still reads from.
    pub(crate) fn position_of_required(&self, tid: Tid) -> Option<usize> {
        self.ranges
            .iter()
            .position(|r| r.read().highest_visible_tid() <= tid)
    }

    /// Check every range and the ordering between them.
    pub fn verify(&self) -> Result<(), InvalidRange> {
        let mut prev: Option<Tid> = None;
        for r in self.ranges.iter() {
            let r = r.read();
            r.verify(false)?;

            let tid = r.highest_visible_tid();
            if let Some(newer) = prev {
                if tid >= newer {
                    return Err(InvalidRange::Regressed {
                        polled: newer,
                        current: tid,
                    });
                }
            }
            prev = Some(tid);
        }
        Ok(())
    }
}

/// Whether two range sequences are made of the very same ranges.
pub fn same_ranges(a: &[SharedRange], b: &[SharedRange]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| Arc::ptr_eq(x, y))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_new_empty() {
        let ix = ObjectIndex::new(1, []).unwrap();
        assert_eq!(1, ix.depth());
        assert_eq!(1, ix.highest_visible_tid());
        assert_eq!(1, ix.maximum_highest_visible_tid());
        assert_eq!(1, ix.minimum_highest_visible_tid());
        assert_eq!(None, ix.complete_since_tid());
        assert!(Arc::ptr_eq(
            ix.get_newest_transaction(),
            ix.get_oldest_transaction()
        ));
    }

    #[test]
    fn test_insert_out_of_range() {
        let ix = ObjectIndex::new(2, []).unwrap();
        ix.insert(1, 1);
        assert_eq!(Some(1), ix.get(1));

        ix.insert(2, 3);
        assert!(!ix.contains(2));
    }

    #[test]
    fn test_new_with_data() {
        // Too high
        let res = ObjectIndex::new(2, [(1, 3)]);
        assert!(matches!(res, Err(InvalidRange::TooNew { .. })));

        // Just right
        let ix = ObjectIndex::new(2, [(1, 1)]).unwrap();
        assert_eq!(2, ix.highest_visible_tid());
        assert_eq!(Some(1), ix.get(1));
    }

    #[test]
    fn test_polled_changes_first_poll_go_forward() {
        let initial_tid = 1;
        let ix = ObjectIndex::new(initial_tid, []).unwrap();
        let initial_range = ix.get_newest_transaction().clone();

        // Cache some data.
        ix.insert(1, initial_tid);
        ix.insert(2, initial_tid);

        let new_polled_tid = 2;
        let ix2 = ix
            .with_polled_changes(new_polled_tid, initial_tid, [(1, new_polled_tid), (3, new_polled_tid)])
            .unwrap();

        // The tid changed, it is a new chain.
        assert!(!Arc::ptr_eq(&ix, &ix2));
        assert!(!Arc::ptr_eq(ix2.get_newest_transaction(), &initial_range));
        assert!(Arc::ptr_eq(ix2.get_oldest_transaction(), &initial_range));
        ix2.verify().unwrap();

        assert_eq!(new_polled_tid, ix2.maximum_highest_visible_tid());
        assert_eq!(initial_tid, ix2.minimum_highest_visible_tid());

        // Partial data is kept and polled data is visible.
        assert_eq!(
            OidTidMap::from([(1, new_polled_tid), (2, initial_tid), (3, new_polled_tid)]),
            ix2.as_dict()
        );

        // The old chain still sees its own state.
        assert_eq!(1, ix.depth());
        assert_eq!(Some(initial_tid), ix.get(1));
    }

    #[test]
    fn test_polled_regressed_tid_is_rejected() {
        let ix = ObjectIndex::new(5, []).unwrap();
        let res = ix.with_polled_changes(4, 1, [(1, 4)]);
        assert_eq!(
            Err(InvalidRange::Regressed {
                polled: 4,
                current: 5
            }),
            res.map(|_| ())
        );
    }

    #[test]
    fn test_polled_empty_not_complete() {
        let ix = ObjectIndex::new(1, []).unwrap();
        let ix2 = ix.with_polled_changes(1, 1, []).unwrap();

        assert!(Arc::ptr_eq(&ix, &ix2));
        // Without changes there is no evidence of completeness.
        assert_eq!(None, ix2.get_oldest_transaction().read().complete_since_tid());
    }

    #[test]
    fn test_polled_same_tid_back_complete() {
        let initial_tid = 2;
        let ix = ObjectIndex::new(initial_tid, []).unwrap();

        let first_poll_tid = initial_tid + 2;

        let ix = ix
            .with_polled_changes(first_poll_tid, initial_tid, [(1, first_poll_tid)])
            .unwrap();

        let ix2 = ix
            .with_polled_changes(first_poll_tid, initial_tid - 1, [
                (1, first_poll_tid),
                (2, initial_tid),
            ])
            .unwrap();

        assert!(Arc::ptr_eq(&ix, &ix2));
        assert_eq!(Some(first_poll_tid), ix.get(1));
        assert_eq!(Some(initial_tid), ix.get(2));
        assert_eq!(
            Some(initial_tid - 1),
            ix.get_newest_transaction().read().complete_since_tid()
        );
    }

    #[test]
    fn test_polled_newer_tid_after_first() {
        let ix = ObjectIndex::new(1, []).unwrap();
        let initial_tid = 1;
        let first_poll_tid = 4;

        let ix2 = ix
            .with_polled_changes(first_poll_tid, initial_tid, [(1, first_poll_tid)])
            .unwrap();
        assert!(!Arc::ptr_eq(&ix, &ix2));

        let second_poll_tid = 6;
        let ix2 = ix2
            .with_polled_changes(second_poll_tid, first_poll_tid, [
                (2, second_poll_tid - 1),
                (3, second_poll_tid),
            ])
            .unwrap();

        assert_eq!(3, ix2.depth());
        assert_eq!(Some(second_poll_tid - 1), ix2.get(2));
        assert_eq!(Some(second_poll_tid), ix2.get(3));
        assert_eq!(Some(first_poll_tid), ix2.get(1));
        assert_eq!(Some(initial_tid), ix2.complete_since_tid());
    }

    #[test]
    fn test_polled_changes_must_be_inside_interval() {
        let ix = ObjectIndex::new(1, []).unwrap();

        let res = ix.with_polled_changes(3, 2, [(1, 4)]);
        assert!(matches!(res, Err(InvalidRange::TooNew { .. })));

        let res = ix.with_polled_changes(3, 2, [(1, 2)]);
        assert!(matches!(res, Err(InvalidRange::TooOld { .. })));
    }

    #[test]
    fn test_get_transactions_from_shares_ranges() {
        let ix = ObjectIndex::new(1, []).unwrap();
        let ix2 = ix.with_polled_changes(2, 1, [(1, 2)]).unwrap();
        let ix3 = ix2.with_polled_changes(3, 2, [(2, 3)]).unwrap();

        assert!(same_ranges(
            ix3.get_transactions_from(1),
            ix2.get_transactions_from(0)
        ));
        assert!(same_ranges(
            ix3.get_transactions_from(2),
            ix.get_transactions_from(0)
        ));
        assert!(!same_ranges(
            ix3.get_transactions_from(0),
            ix2.get_transactions_from(0)
        ));
        assert!(ix3.get_transactions_from(10).is_empty());
    }

    #[test]
    fn test_collect_changes_after() {
        let ix = ObjectIndex::new(1, [(9, 1)]).unwrap();
        let ix = ix.with_polled_changes(10, 1, [(1, 5), (2, 10)]).unwrap();
        let ix = ix.with_polled_changes(15, 10, [(1, 15)]).unwrap();

        assert_eq!(Some(OidTidMap::new()), ix.collect_changes_after(15));
        assert_eq!(
            Some(OidTidMap::from([(1, 15)])),
            ix.collect_changes_after(10)
        );
        assert_eq!(
            Some(OidTidMap::from([(1, 15), (2, 10)])),
            ix.collect_changes_after(5)
        );
        assert_eq!(
            Some(OidTidMap::from([(1, 15), (2, 10)])),
            ix.collect_changes_after(1)
        );
        // Nothing says what happened before the first poll.
        assert_eq!(None, ix.collect_changes_after(0));
    }

    #[test]
    fn test_is_complete_since_with_gap() {
        let ix = ObjectIndex::new(1, []).unwrap();
        // Polled from 6, nobody knows what happened in (1, 6].
        let ix = ix.with_polled_changes(8, 6, [(1, 7)]).unwrap();

        assert!(ix.is_complete_since(8));
        assert!(ix.is_complete_since(6));
        assert!(!ix.is_complete_since(5));
        assert!(!ix.is_complete_since(1));
        assert_eq!(None, ix.collect_changes_after(1));
    }

    #[test]
    fn test_verify_detects_bad_order() {
        let a = Arc::new(RwLock::new(TransactionRange::new(3, None, []).unwrap()));
        let b = Arc::new(RwLock::new(TransactionRange::new(5, None, []).unwrap()));

        let ix = ObjectIndex::from_ranges(vec![a, b]);
        assert!(ix.verify().is_err());
    }
}
