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

//! What the index needs from a database adapter.
//!
//! Both traits are implemented by the SQL layer; this crate never talks to a database
//! directly.

use std::io;

use crate::IOResultStream;
use crate::Oid;
use crate::Tid;

/// The result of asking the database what changed since a tid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolledChanges {
    /// Every `(oid, tid)` changed after the tid polled from, up to and including `tid`.
    pub changes: Vec<(Oid, Tid)>,

    /// The newest committed tid visible to the polling cursor.
    pub tid: Tid,
}

impl PolledChanges {
    pub fn new(changes: impl IntoIterator<Item = (Oid, Tid)>, tid: Tid) -> Self {
        Self {
            changes: changes.into_iter().collect(),
            tid,
        }
    }
}

/// Polls the database for committed changes.
///
/// `Cursor` is whatever handle the adapter reads through, usually the connection and cursor
/// of the reader that is polling.
#[async_trait::async_trait]
pub trait Poller: Send + Sync {
    type Cursor: Send;

    /// The newest committed tid, or `0` if the database has no transaction yet.
    async fn get_current_tid(&self, cursor: &mut Self::Cursor) -> Result<Tid, io::Error>;

    /// The changes committed after `prev_polled_tid`.
    ///
    /// Returns `Ok(None)` if the changes can not be computed: `prev_polled_tid` is no longer
    /// in the database, because it is packed away or the cursor now reads a replica that
    /// lags behind it.
    async fn poll_invalidations(
        &self,
        cursor: &mut Self::Cursor,
        prev_polled_tid: Tid,
    ) -> Result<Option<PolledChanges>, io::Error>;
}

/// Reads object rows in bulk.
#[async_trait::async_trait]
pub trait ObjectMover: Send + Sync {
    /// The current tid of every oid in `oids` that still exists.
    ///
    /// `oids` is one bounded batch; batching is up to the caller.
    async fn current_object_tids(
        &self,
        oids: &[Oid],
    ) -> Result<IOResultStream<(Oid, Tid)>, io::Error>;
}
