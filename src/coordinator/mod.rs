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

//! The per-database owner of the shared [`ObjectIndex`] and of the [`Viewer`]s reading it.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;

use crate::adapter::PolledChanges;
use crate::adapter::Poller;
use crate::batch::Clock;
use crate::batch::MonotonicClock;
use crate::config::CoordinatorConfig;
use crate::object_index::ObjectIndex;
use crate::viewer::Staleness;
use crate::viewer::Viewer;
use crate::OidTidMap;
use crate::Tid;

mod stats;
mod vacuum;

pub use stats::CoordinatorStats;
pub use stats::StatsSnapshot;

/// What a viewer has to drop from its cache after a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// Every listed oid changed at the given tid; everything else is still valid.
    Changes(OidTidMap),
    /// Nothing cached can be trusted any more.
    InvalidateAll,
}

impl Polled {
    pub fn changes(&self) -> Option<&OidTidMap> {
        match self {
            Polled::Changes(c) => Some(c),
            Polled::InvalidateAll => None,
        }
    }

    pub fn is_invalidate_all(&self) -> bool {
        matches!(self, Polled::InvalidateAll)
    }
}

pub(crate) struct State {
    pub(crate) object_index: Option<Arc<ObjectIndex>>,
    viewers: Vec<Weak<Viewer>>,
    pub(crate) maximum_highest_visible_tid: Option<Tid>,
    pub(crate) minimum_highest_visible_tid: Option<Tid>,
    pub(crate) max_allowed_index_depth: usize,
}

impl State {
    /// Registered viewers that are still alive. Dropped ones are forgotten.
    pub(crate) fn live_viewers(&mut self) -> Vec<Arc<Viewer>> {
        let mut live = Vec::with_capacity(self.viewers.len());
        self.viewers.retain(|w| match w.upgrade() {
            Some(v) => {
                live.push(v);
                true
            }
            None => false,
        });
        live
    }

    /// Recompute the range of tids pinned by attached viewers.
    pub(crate) fn update_tid_bounds(&mut self) {
        let tids = self
            .live_viewers()
            .iter()
            .filter_map(|v| v.state().attached_tid())
            .collect::<Vec<_>>();

        self.maximum_highest_visible_tid = tids.iter().copied().max();
        self.minimum_highest_visible_tid = tids.iter().copied().min();
    }
}

/// How a poll continues after the current tid is known.
enum Start {
    Done(Polled),
    Poll { base: Arc<ObjectIndex>, since: Tid },
}

/// Shares one polled history between every [`Viewer`] of a database.
///
/// The lock is never held while talking to the database: only reading and installing the
/// chain is serialized.
pub struct Coordinator {
    config: CoordinatorConfig,
    state: Mutex<State>,
    stats: CoordinatorStats,
    pub(crate) clock: Arc<dyn Clock>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("depth", &state.object_index.as_ref().map(|ix| ix.depth()))
            .field("viewers", &state.viewers.len())
            .field("max_tid", &state.maximum_highest_visible_tid)
            .field("min_tid", &state.minimum_highest_visible_tid)
            .finish()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = State {
            object_index: None,
            viewers: vec![],
            maximum_highest_visible_tid: None,
            minimum_highest_visible_tid: None,
            max_allowed_index_depth: config.max_allowed_index_depth.max(1),
        };

        Coordinator {
            config,
            state: Mutex::new(state),
            stats: CoordinatorStats::default(),
            clock: Arc::new(MonotonicClock),
        }
    }

    /// Replace the clock restore deadlines are measured with.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn object_index(&self) -> Option<Arc<ObjectIndex>> {
        self.state.lock().object_index.clone()
    }

    pub fn maximum_highest_visible_tid(&self) -> Option<Tid> {
        self.state.lock().maximum_highest_visible_tid
    }

    pub fn minimum_highest_visible_tid(&self) -> Option<Tid> {
        self.state.lock().minimum_highest_visible_tid
    }

    pub fn max_allowed_index_depth(&self) -> usize {
        self.state.lock().max_allowed_index_depth
    }

    pub fn set_max_allowed_index_depth(&self, depth: usize) {
        self.state.lock().max_allowed_index_depth = depth.max(1);
    }

    pub fn register(&self, viewer: &Arc<Viewer>) {
        let mut state = self.state.lock();
        let live = state.live_viewers();
        if live.iter().any(|v| Arc::ptr_eq(v, viewer)) {
            return;
        }
        state.viewers.push(Arc::downgrade(viewer));
        state.update_tid_bounds();
    }

    /// Forget `viewer`. The chain is dropped with the last viewer.
    pub fn unregister(&self, viewer: &Viewer) {
        let mut state = self.state.lock();
        let target = viewer as *const Viewer;
        state.viewers.retain(|w| w.as_ptr() != target);

        if state.live_viewers().is_empty() {
            debug!("Coordinator::unregister: last viewer gone, dropping index");
            state.object_index = None;
        }
        state.update_tid_bounds();
    }

    #[cfg(test)]
    pub(crate) fn set_object_index(&self, index: Option<Arc<ObjectIndex>>) {
        self.state.lock().object_index = index;
    }

    /// Bring `viewer` up to date with the database and tell it what to drop from its cache.
    ///
    /// Errors from the adapter are returned as is. A polled delta that does not fit the
    /// installed chain resets the coordinator and is returned as
    /// [`io::ErrorKind::InvalidData`].
    pub async fn poll<P>(
        &self,
        viewer: &Arc<Viewer>,
        poller: &P,
        cursor: &mut P::Cursor,
    ) -> Result<Polled, io::Error>
    where
        P: Poller + ?Sized,
    {
        CoordinatorStats::incr(&self.stats.polls, 1);

        let current_tid = poller.get_current_tid(cursor).await?;

        let (base, since) = match self.begin_poll(viewer, current_tid)? {
            Start::Done(polled) => return Ok(polled),
            Start::Poll { base, since } => (base, since),
        };

        let polled = poller.poll_invalidations(cursor, since).await?;

        self.finish_poll(viewer, base, since, polled)
    }

    fn begin_poll(&self, viewer: &Arc<Viewer>, current_tid: Tid) -> Result<Start, io::Error> {
        let mut state = self.state.lock();

        if current_tid == 0 {
            if state.object_index.is_some() {
                info!("Coordinator::poll: database has no transaction any more, resetting");
                self.reset(&mut state, viewer, "database was emptied");
                return Ok(Start::Done(Polled::InvalidateAll));
            }

            let mut vs = viewer.state();
            let had_index = vs.object_index.take().is_some();
            let res = if had_index || vs.detached {
                Polled::InvalidateAll
            } else {
                Polled::Changes(OidTidMap::new())
            };
            vs.detached = false;
            return Ok(Start::Done(res));
        }

        if let Some(base) = &state.object_index {
            let since = base.highest_visible_tid();
            return Ok(Start::Poll {
                base: base.clone(),
                since,
            });
        }

        let index = ObjectIndex::new(current_tid, []).map_err(|e| {
            error!("Coordinator::poll: can not bootstrap at tid={}: {}", current_tid, e);
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;

        debug!("Coordinator::poll: bootstrap at tid={}", current_tid);
        CoordinatorStats::incr(&self.stats.bootstraps, 1);

        state.object_index = Some(index.clone());
        let res = self.attach(viewer, &index);
        state.update_tid_bounds();

        Ok(Start::Done(res))
    }

    fn finish_poll(
        &self,
        viewer: &Arc<Viewer>,
        base: Arc<ObjectIndex>,
        since: Tid,
        polled: Option<PolledChanges>,
    ) -> Result<Polled, io::Error> {
        let mut state = self.state.lock();

        let polled = match polled {
            None => {
                warn!(
                    "Coordinator::poll: changes since tid={} can not be computed, resetting",
                    since
                );
                self.reset(&mut state, viewer, "changes can not be computed");
                return Ok(Polled::InvalidateAll);
            }
            Some(p) if p.tid < since => {
                warn!(
                    "Coordinator::poll: polled tid={} is older than tid={}, resetting",
                    p.tid, since
                );
                self.reset(&mut state, viewer, "database went back in time");
                return Ok(Polled::InvalidateAll);
            }
            Some(p) => p,
        };

        let Some(installed) = state.object_index.clone() else {
            debug!("Coordinator::poll: reset by another viewer while polling");
            let mut vs = viewer.state();
            vs.object_index = None;
            vs.detached = false;
            return Ok(Polled::InvalidateAll);
        };

        // Reset and bootstrapped again, behind what this cursor polled from: nothing polled
        // `(installed, since]`, so the result can not be folded onto it.
        if !Arc::ptr_eq(&installed, &base) && installed.highest_visible_tid() < since {
            debug!(
                "Coordinator::poll: installed tid={} is behind polled-from tid={}, dropping poll",
                installed.highest_visible_tid(),
                since
            );
            let mut vs = viewer.state();
            vs.object_index = None;
            vs.detached = false;
            return Ok(Polled::InvalidateAll);
        }

        let PolledChanges { changes, tid } = polled;

        // Another viewer may have moved the shared chain past what this cursor sees.
        let publish = tid >= installed.highest_visible_tid();
        let onto = if publish { &installed } else { &base };

        let folded = match onto.with_polled_changes(tid, since, changes) {
            Ok(x) => x,
            Err(e) => {
                error!("Coordinator::poll: invalid changes polled at tid={}: {}", tid, e);
                self.reset(&mut state, viewer, "invalid changes polled");
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        if !publish {
            debug!(
                "Coordinator::poll: tid={} is behind installed tid={}, not publishing",
                tid,
                installed.highest_visible_tid()
            );
            let res = self.attach(viewer, &folded);
            state.update_tid_bounds();
            return Ok(res);
        }

        state.object_index = Some(folded.clone());
        let res = self.attach(viewer, &folded);
        state.update_tid_bounds();

        let vacuumed = self.vacuum(&mut state, viewer.local_client().as_ref(), folded);
        state.object_index = Some(vacuumed.clone());
        viewer.state().object_index = Some(vacuumed);

        Ok(res)
    }

    /// Tell `viewer` what changed between its chain and `index`, then move it onto `index`.
    fn attach(&self, viewer: &Viewer, index: &Arc<ObjectIndex>) -> Polled {
        let mut vs = viewer.state();

        let res = if vs.detached {
            CoordinatorStats::incr(&self.stats.invalidate_all_detached, 1);
            Polled::InvalidateAll
        } else {
            match vs.highest_visible_tid() {
                None => Polled::Changes(OidTidMap::new()),
                Some(tid) if tid > index.highest_visible_tid() => Polled::InvalidateAll,
                Some(tid) => match index.collect_changes_after(tid) {
                    Some(changes) => Polled::Changes(changes),
                    None => {
                        CoordinatorStats::incr(&self.stats.invalidate_all_incomplete, 1);
                        Polled::InvalidateAll
                    }
                },
            }
        };

        let res = match (res, vs.last_committed_tid.take()) {
            (Polled::Changes(mut changes), Some(own)) => {
                changes.retain(|_oid, tid| *tid != own);
                Polled::Changes(changes)
            }
            (res, _) => res,
        };

        vs.object_index = Some(index.clone());
        vs.detached = false;
        if !res.is_invalidate_all() {
            vs.staleness = Staleness::Normal;
        }

        res
    }

    /// Drop the chain and detach every viewer reading any of it.
    ///
    /// `caller` receives `InvalidateAll` right away, so it is left without a chain rather
    /// than detached.
    fn reset(&self, state: &mut State, caller: &Viewer, reason: &str) {
        info!("Coordinator::reset: {}", reason);
        CoordinatorStats::incr(&self.stats.resets, 1);

        for v in state.live_viewers() {
            let mut vs = v.state();
            if vs.object_index.is_some() {
                vs.detach();
            }
        }

        {
            let mut vs = caller.state();
            vs.object_index = None;
            vs.detached = false;
            vs.last_committed_tid = None;
            vs.staleness = Staleness::Stale(reason.to_string());
        }

        state.object_index = None;
        state.update_tid_bounds();
    }
}
