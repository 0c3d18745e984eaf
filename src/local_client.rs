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

//! Defines what the index needs from the reader-local cache.
//!
//! The local cache stores object states keyed by `(oid, tid)` and may be persisted and
//! reloaded between process runs. It is shared by every viewer of a database in a process,
//! thus all methods take `&self`.

use crate::Oid;
use crate::OidTidMap;
use crate::Tid;

/// A reader-local cache of object states.
///
/// A key `(oid, Some(tid))` addresses the state `oid` had as of transaction `tid`.
/// A key `(oid, None)` addresses a *frozen* state: one known to be current for every
/// viewer, so it can be served without consulting the index.
pub trait LocalClient: Send + Sync {
    /// Whether a state is cached under the key `(oid, tid)`.
    fn contains(&self, oid: Oid, tid: Option<Tid>) -> bool;

    /// The cached state and its tid under the key `(oid, tid)`.
    fn get(&self, oid: Oid, tid: Option<Tid>) -> Option<(Vec<u8>, Tid)>;

    /// Cache the `state` that `oid` had as of `tid`.
    fn set(&self, oid: Oid, tid: Tid, state: Vec<u8>);

    /// Every oid that has a cached state.
    fn keys(&self) -> Vec<Oid>;

    /// Number of cached states.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the state cached for `oid` is the one written at `tid`.
    fn contains_oid_with_tid(&self, oid: Oid, tid: Tid) -> bool;

    /// Drop states that could not be verified against the database after a reload.
    fn remove_invalid_persistent_oids(&self, oids: &[Oid]);

    /// Mark the states cached at exactly these `(oid, tid)` as current for every viewer.
    fn freeze(&self, oids_tids: &OidTidMap);

    /// Drop every cached state of these oids.
    fn invalidate_all(&self, oids: &[Oid]);
}
