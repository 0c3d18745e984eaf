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

//! Provides a simple in-memory implementation of [`LocalClient`].
//!
//! The [`MemoryClient`] keeps one state per oid in a [`BTreeMap`]. It is primarily
//! intended for testing and demonstration purposes.

use std::collections::BTreeMap;

use log::debug;
use parking_lot::RwLock;

use crate::LocalClient;
use crate::Oid;
use crate::OidTidMap;
use crate::Tid;

/// A cached object state.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cached {
    state: Vec<u8>,
    tid: Tid,
    frozen: bool,
}

/// An in-memory [`LocalClient`] that keeps the newest cached state of each oid.
///
/// A frozen state stays reachable under its original `(oid, tid)` key as well as under
/// `(oid, None)`, without taking an extra entry.
///
/// # Examples
///
/// ```
/// use mvcc_cache_index::impls::memory_client::MemoryClient;
/// use mvcc_cache_index::LocalClient;
/// use mvcc_cache_index::OidTidMap;
///
/// let client = MemoryClient::default();
/// client.set(1, 5, b"state".to_vec());
/// assert!(client.contains(1, Some(5)));
///
/// client.freeze(&OidTidMap::from([(1, 5)]));
/// assert!(client.contains(1, None));
/// assert_eq!(1, client.len());
/// ```
#[derive(Debug, Default)]
pub struct MemoryClient {
    data: RwLock<BTreeMap<Oid, Cached>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalClient for MemoryClient {
    fn contains(&self, oid: Oid, tid: Option<Tid>) -> bool {
        self.get(oid, tid).is_some()
    }

    fn get(&self, oid: Oid, tid: Option<Tid>) -> Option<(Vec<u8>, Tid)> {
        let data = self.data.read();
        let cached = data.get(&oid)?;

        let hit = match tid {
            Some(tid) => cached.tid == tid,
            None => cached.frozen,
        };

        if hit {
            Some((cached.state.clone(), cached.tid))
        } else {
            None
        }
    }

    fn set(&self, oid: Oid, tid: Tid, state: Vec<u8>) {
        let mut data = self.data.write();

        if let Some(existing) = data.get(&oid) {
            // Only the newest state of an oid is kept.
            if existing.tid > tid {
                return;
            }
            if existing.tid == tid {
                let frozen = existing.frozen;
                data.insert(oid, Cached { state, tid, frozen });
                return;
            }
        }

        data.insert(oid, Cached {
            state,
            tid,
            frozen: false,
        });
    }

    fn keys(&self) -> Vec<Oid> {
        self.data.read().keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn contains_oid_with_tid(&self, oid: Oid, tid: Tid) -> bool {
        matches!(self.data.read().get(&oid), Some(c) if c.tid == tid)
    }

    fn remove_invalid_persistent_oids(&self, oids: &[Oid]) {
        let mut data = self.data.write();
        for oid in oids {
            data.remove(oid);
        }
        debug!(
            "MemoryClient::remove_invalid_persistent_oids: removed {} oids",
            oids.len()
        );
    }

    fn freeze(&self, oids_tids: &OidTidMap) {
        let mut data = self.data.write();
        for (oid, tid) in oids_tids {
            if let Some(c) = data.get_mut(oid) {
                if c.tid == *tid {
                    c.frozen = true;
                }
            }
        }
    }

    fn invalidate_all(&self, oids: &[Oid]) {
        let mut data = self.data.write();
        for oid in oids {
            data.remove(oid);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_set_and_get() {
        let c = MemoryClient::new();
        c.set(1, 2, b"a".to_vec());

        assert_eq!(Some((b"a".to_vec(), 2)), c.get(1, Some(2)));
        assert_eq!(None, c.get(1, Some(3)));
        assert_eq!(None, c.get(1, None), "not frozen");
        assert_eq!(None, c.get(2, Some(2)));
    }

    #[test]
    fn test_set_keeps_newest() {
        let c = MemoryClient::new();
        c.set(1, 5, b"new".to_vec());
        c.set(1, 3, b"old".to_vec());
        assert_eq!(Some((b"new".to_vec(), 5)), c.get(1, Some(5)));
        assert!(!c.contains(1, Some(3)));

        c.set(1, 7, b"newer".to_vec());
        assert!(c.contains_oid_with_tid(1, 7));
        assert_eq!(1, c.len());
    }

    #[test]
    fn test_freeze() {
        let c = MemoryClient::new();
        c.set(1, 1, b"a".to_vec());
        c.set(2, 2, b"b".to_vec());

        // Only an exact tid match is frozen.
        c.freeze(&OidTidMap::from([(1, 1), (2, 1), (3, 3)]));

        assert!(c.contains(1, None));
        assert!(c.contains(1, Some(1)));
        assert!(!c.contains(2, None));
        assert_eq!(2, c.len());

        // A newer state is not frozen.
        c.set(1, 4, b"c".to_vec());
        assert!(!c.contains(1, None));
    }

    #[test]
    fn test_invalidate_and_remove() {
        let c = MemoryClient::new();
        for oid in 1..=4 {
            c.set(oid, 1, vec![]);
        }

        c.invalidate_all(&[1, 2, 9]);
        assert_eq!(vec![3, 4], c.keys());

        c.remove_invalid_persistent_oids(&[4]);
        assert_eq!(vec![3], c.keys());
        assert!(!c.is_empty());
    }
}
