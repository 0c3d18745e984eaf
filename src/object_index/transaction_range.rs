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

//! A snapshot of the oid -> tid changes known between two transactions.

use std::collections::btree_map::Entry;

use crate::object_index::errors::InvalidRange;
use crate::Oid;
use crate::OidTidMap;
use crate::Tid;

/// The changes known to have happened up to `highest_visible_tid`.
///
/// Entries with a tid in `(complete_since_tid, highest_visible_tid]` are a complete record
/// of every oid changed in that interval.
/// Entries at or below `complete_since_tid`, or any entry when `complete_since_tid` is
/// `None`, are partial knowledge kept for cache efficiency: each of them is still true as
/// of `highest_visible_tid`, but oids missing from the range tell nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRange {
    highest_visible_tid: Tid,
    complete_since_tid: Option<Tid>,
    raw_data: OidTidMap,
}

impl TransactionRange {
    /// Build a range and check it with [`verify(true)`](Self::verify).
    ///
    /// When `complete_since_tid` is given, every change in `data` must be inside
    /// `(complete_since_tid, highest_visible_tid]`.
    pub fn new(
        highest_visible_tid: Tid,
        complete_since_tid: Option<Tid>,
        data: impl IntoIterator<Item = (Oid, Tid)>,
    ) -> Result<Self, InvalidRange> {
        let range = Self {
            highest_visible_tid,
            complete_since_tid,
            raw_data: data.into_iter().collect(),
        };
        range.verify(true)?;
        Ok(range)
    }

    pub fn highest_visible_tid(&self) -> Tid {
        self.highest_visible_tid
    }

    pub fn complete_since_tid(&self) -> Option<Tid> {
        self.complete_since_tid
    }

    pub fn raw_data(&self) -> &OidTidMap {
        &self.raw_data
    }

    pub fn get(&self, oid: Oid) -> Option<Tid> {
        self.raw_data.get(&oid).copied()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.raw_data.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.raw_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_data.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = (Oid, Tid)> + '_ {
        self.raw_data.iter().map(|(oid, tid)| (*oid, *tid))
    }

    /// Whether this range is a complete record of every change in `(tid, highest_visible_tid]`.
    pub fn covers(&self, tid: Tid) -> bool {
        matches!(self.complete_since_tid, Some(since) if since <= tid)
    }

    /// Record a partial fact learned by a reader looking at this range.
    ///
    /// A tid this range can not see is ignored, and so is an oid it already knows about.
    /// Returns `true` if the entry is added.
    pub fn insert(&mut self, oid: Oid, tid: Tid) -> bool {
        if tid > self.highest_visible_tid {
            return false;
        }

        match self.raw_data.entry(oid) {
            Entry::Vacant(e) => {
                e.insert(tid);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Bring this, older, range up to the tids of `definitive`.
    ///
    /// Entries of `definitive` overwrite ours; entries only present here are kept.
    pub fn complete_to(&mut self, definitive: &Self) -> Result<(), InvalidRange> {
        if definitive.highest_visible_tid < self.highest_visible_tid {
            return Err(InvalidRange::Regressed {
                polled: definitive.highest_visible_tid,
                current: self.highest_visible_tid,
            });
        }

        self.highest_visible_tid = definitive.highest_visible_tid;
        self.complete_since_tid = definitive.complete_since_tid;
        self.raw_data.extend(definitive.items());
        Ok(())
    }

    /// Merge another view of the same transaction into this one.
    ///
    /// Both describe the database at the same tid, so they agree on every shared oid.
    /// The result is complete over the wider of the two intervals.
    ///
    /// Returns `true` if this range gained any information.
    pub fn merge_same_tid(&mut self, other: &Self) -> Result<bool, InvalidRange> {
        if self.highest_visible_tid != other.highest_visible_tid {
            return Err(InvalidRange::TidMismatch {
                this: self.highest_visible_tid,
                other: other.highest_visible_tid,
            });
        }

        let mut changed = false;

        for (oid, tid) in other.items() {
            match self.raw_data.entry(oid) {
                Entry::Vacant(e) => {
                    e.insert(tid);
                    changed = true;
                }
                Entry::Occupied(mut e) => {
                    if *e.get() != tid {
                        e.insert(tid);
                        changed = true;
                    }
                }
            }
        }

        let since = older_complete_since(self.complete_since_tid, other.complete_since_tid);
        if since != self.complete_since_tid {
            self.complete_since_tid = since;
            changed = true;
        }

        Ok(changed)
    }

    /// Copy the entries of an older range that this range does not know about.
    ///
    /// Our own entries are newer and are never overwritten; `older` is not modified.
    ///
    /// Returns the number of entries copied.
    pub fn merge_older_tid(&mut self, older: &Self) -> usize {
        let mut copied = 0;
        for (oid, tid) in older.items() {
            if let Entry::Vacant(e) = self.raw_data.entry(oid) {
                e.insert(tid);
                copied += 1;
            }
        }
        copied
    }

    /// Check the tid ordering of this range.
    ///
    /// `initial` additionally requires every entry to be inside the complete interval,
    /// which holds for freshly polled data but not after partial data is added.
    pub fn verify(&self, initial: bool) -> Result<(), InvalidRange> {
        if let Some(since) = self.complete_since_tid {
            if since >= self.highest_visible_tid {
                return Err(InvalidRange::EmptyInterval {
                    highest_visible_tid: self.highest_visible_tid,
                    complete_since_tid: since,
                });
            }
        }

        for (oid, tid) in self.items() {
            if tid > self.highest_visible_tid {
                return Err(InvalidRange::TooNew {
                    oid,
                    tid,
                    highest_visible_tid: self.highest_visible_tid,
                });
            }

            if initial {
                if let Some(since) = self.complete_since_tid {
                    if tid <= since {
                        return Err(InvalidRange::TooOld {
                            oid,
                            tid,
                            complete_since_tid: since,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// The older of two lower bounds. `None` makes no claim and loses to any bound.
fn older_complete_since(a: Option<Tid>, b: Option<Tid>) -> Option<Tid> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
