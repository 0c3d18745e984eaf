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

//! A reader's view of the shared index.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::LocalClient;
use crate::ObjectIndex;
use crate::Oid;
use crate::Tid;

/// Whether the data a viewer serves can still be trusted.
///
/// The storage layer consults this instead of swapping its own behavior: while `Stale`,
/// reads should be refused with the recorded reason until the next poll succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Staleness {
    #[default]
    Normal,
    /// The viewer lost continuity with the database, e.g. it now reads a replica that lags
    /// behind what it has already seen.
    Stale(String),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Staleness::Stale(_))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ViewerState {
    pub(crate) object_index: Option<Arc<ObjectIndex>>,
    pub(crate) detached: bool,
    pub(crate) staleness: Staleness,
    pub(crate) last_committed_tid: Option<Tid>,
}

impl ViewerState {
    pub(crate) fn highest_visible_tid(&self) -> Option<Tid> {
        self.object_index.as_ref().map(|ix| ix.highest_visible_tid())
    }

    /// Whether this viewer pins a position in the shared history.
    pub(crate) fn attached_tid(&self) -> Option<Tid> {
        if self.detached {
            None
        } else {
            self.highest_visible_tid()
        }
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.object_index = None;
    }
}

/// One per database connection: the chain it currently reads and the cache it reads into.
///
/// A viewer is driven by one task at a time, but the [`Coordinator`](crate::Coordinator)
/// may detach it while another viewer polls, so its state sits behind a lock.
pub struct Viewer {
    local_client: Arc<dyn LocalClient>,
    state: Mutex<ViewerState>,
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Viewer")
            .field("highest_visible_tid", &state.highest_visible_tid())
            .field("detached", &state.detached)
            .field("staleness", &state.staleness)
            .finish()
    }
}

impl Viewer {
    pub fn new(local_client: Arc<dyn LocalClient>) -> Self {
        Self {
            local_client,
            state: Mutex::new(ViewerState::default()),
        }
    }

    pub fn local_client(&self) -> &Arc<dyn LocalClient> {
        &self.local_client
    }

    /// The chain this viewer reads, `None` before the first poll or after being detached.
    pub fn object_index(&self) -> Option<Arc<ObjectIndex>> {
        self.state.lock().object_index.clone()
    }

    pub fn highest_visible_tid(&self) -> Option<Tid> {
        self.state.lock().highest_visible_tid()
    }

    /// Whether the coordinator cut this viewer off the shared history.
    ///
    /// Its next poll invalidates everything.
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn staleness(&self) -> Staleness {
        self.state.lock().staleness.clone()
    }

    /// Clear a stale mark once the storage layer has started over.
    pub fn no_longer_stale(&self) {
        self.state.lock().staleness = Staleness::Normal;
    }

    /// Record the tid of a transaction this viewer committed.
    ///
    /// Its own changes are left out of the next poll result.
    pub fn after_commit(&self, tid: Tid) {
        self.state.lock().last_committed_tid = Some(tid);
    }

    /// The tid of the state of `oid` this viewer should see, if known.
    pub fn lookup(&self, oid: Oid) -> Option<Tid> {
        let index = self.object_index()?;
        index.get(oid)
    }

    /// Remember that `oid` was at `tid` as seen by this viewer.
    pub fn remember(&self, oid: Oid, tid: Tid) -> bool {
        match self.object_index() {
            Some(index) => index.insert(oid, tid),
            None => false,
        }
    }

    /// The cached state of `oid` valid for this viewer.
    ///
    /// An oid the index knows is looked up at its exact tid, others only if frozen.
    pub fn load_cached(&self, oid: Oid) -> Option<(Vec<u8>, Tid)> {
        match self.lookup(oid) {
            Some(tid) => self.local_client.get(oid, Some(tid)),
            None => self.local_client.get(oid, None),
        }
    }

    /// Cache a state loaded from the database at `tid`.
    pub fn store_cached(&self, oid: Oid, tid: Tid, state: Vec<u8>) {
        self.local_client.set(oid, tid, state);
        self.remember(oid, tid);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ViewerState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::impls::memory_client::MemoryClient;
    use crate::OidTidMap;

    fn viewer() -> Viewer {
        Viewer::new(Arc::new(MemoryClient::new()))
    }

    #[test]
    fn test_new_viewer_has_no_index() {
        let v = viewer();
        assert!(v.object_index().is_none());
        assert_eq!(None, v.highest_visible_tid());
        assert!(!v.is_detached());
        assert_eq!(Staleness::Normal, v.staleness());
        assert!(!v.remember(1, 1));
        assert_eq!(None, v.lookup(1));
    }

    #[test]
    fn test_cache_through_index() {
        let v = viewer();
        v.state().object_index = Some(ObjectIndex::new(5, []).unwrap());

        v.store_cached(1, 3, b"x".to_vec());
        assert_eq!(Some(3), v.lookup(1));
        assert_eq!(Some((b"x".to_vec(), 3)), v.load_cached(1));

        // Not in the index and not frozen.
        v.local_client().set(2, 2, b"y".to_vec());
        assert_eq!(None, v.load_cached(2));

        v.local_client().freeze(&OidTidMap::from([(2, 2)]));
        assert_eq!(Some((b"y".to_vec(), 2)), v.load_cached(2));
    }

    #[test]
    fn test_detach() {
        let v = viewer();
        v.state().object_index = Some(ObjectIndex::new(5, []).unwrap());
        assert_eq!(Some(5), v.state().attached_tid());

        v.state().detach();
        assert!(v.is_detached());
        assert!(v.object_index().is_none());
        assert_eq!(None, v.state().attached_tid());
    }

    #[test]
    fn test_staleness() {
        let v = viewer();
        v.state().staleness = Staleness::Stale("replica lags".to_string());
        assert!(v.staleness().is_stale());

        v.no_longer_stale();
        assert!(!v.staleness().is_stale());
    }
}
