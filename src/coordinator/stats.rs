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

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

/// Counters of what a [`Coordinator`](crate::Coordinator) did, for monitoring.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub(crate) polls: AtomicU64,
    pub(crate) bootstraps: AtomicU64,
    pub(crate) resets: AtomicU64,
    pub(crate) invalidate_all_detached: AtomicU64,
    pub(crate) invalidate_all_incomplete: AtomicU64,
    pub(crate) vacuums: AtomicU64,
    pub(crate) detached_by_vacuum: AtomicU64,
    pub(crate) restore_timeouts: AtomicU64,
}

/// A point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub polls: u64,
    /// A new chain was created for an empty coordinator.
    pub bootstraps: u64,
    /// The chain was dropped and every viewer detached.
    pub resets: u64,
    /// A detached viewer polled and was told to drop everything.
    pub invalidate_all_detached: u64,
    /// The chain could not tell a viewer what it missed.
    pub invalidate_all_incomplete: u64,
    /// Ranges dropped from the tail of the chain.
    pub vacuums: u64,
    pub detached_by_vacuum: u64,
    pub restore_timeouts: u64,
}

impl CoordinatorStats {
    pub(crate) fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            polls: get(&self.polls),
            bootstraps: get(&self.bootstraps),
            resets: get(&self.resets),
            invalidate_all_detached: get(&self.invalidate_all_detached),
            invalidate_all_incomplete: get(&self.invalidate_all_incomplete),
            vacuums: get(&self.vacuums),
            detached_by_vacuum: get(&self.detached_by_vacuum),
            restore_timeouts: get(&self.restore_timeouts),
        }
    }
}
