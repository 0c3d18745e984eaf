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

use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;

use crate::coordinator::CoordinatorStats;
use crate::coordinator::State;
use crate::local_client::LocalClient;
use crate::object_index::errors::InvalidRange;
use crate::object_index::ObjectIndex;
use crate::object_index::SharedRange;
use crate::object_index::TransactionRange;
use crate::Coordinator;
use crate::Oid;
use crate::OidTidMap;
use crate::Tid;

impl Coordinator {
    /// Shorten the tail of `index` to what attached viewers still read.
    ///
    /// If the chain is still deeper than allowed, the viewers furthest behind are detached
    /// once and the tail is shortened again.
    pub(crate) fn vacuum(
        &self,
        state: &mut State,
        local_client: &dyn LocalClient,
        index: Arc<ObjectIndex>,
    ) -> Arc<ObjectIndex> {
        let index = self.discard_unreachable(state, local_client, index);

        if index.depth() <= state.max_allowed_index_depth {
            return index;
        }

        let detached = detach_furthest_behind(state, index.highest_visible_tid());
        if detached == 0 {
            return index;
        }
        CoordinatorStats::incr(&self.stats().detached_by_vacuum, detached as u64);

        state.update_tid_bounds();
        self.discard_unreachable(state, local_client, index)
    }

    fn discard_unreachable(
        &self,
        state: &State,
        local_client: &dyn LocalClient,
        index: Arc<ObjectIndex>,
    ) -> Arc<ObjectIndex> {
        let Some(required_tid) = state.minimum_highest_visible_tid else {
            return index;
        };
        let Some(pos) = index.position_of_required(required_tid) else {
            return index;
        };
        if pos + 1 >= index.depth() {
            return index;
        }

        let ranges = index.get_transactions_from(0);
        let kept = ObjectIndex::from_ranges(ranges[..=pos].to_vec());
        let obsolete = &ranges[pos + 1..];

        debug!(
            "Coordinator::vacuum: required tid={}, depth {} -> {}",
            required_tid,
            index.depth(),
            kept.depth()
        );
        CoordinatorStats::incr(&self.stats().vacuums, obsolete.len() as u64);

        match compact(obsolete) {
            Ok(compacted) => fold_into_required(&kept, &compacted, local_client),
            Err(e) => {
                error!("Coordinator::vacuum: can not compact discarded ranges: {}", e);
            }
        }

        kept
    }
}

/// Collapse ranges, newest first, into one range at the newest tid.
fn compact(ranges: &[SharedRange]) -> Result<TransactionRange, InvalidRange> {
    let mut oldest_first = ranges.iter().rev();

    let mut acc = match oldest_first.next() {
        Some(r) => r.read().clone(),
        None => return Ok(TransactionRange::default()),
    };

    for r in oldest_first {
        acc.complete_to(&r.read())?;
    }
    Ok(acc)
}

/// Keep what the discarded tail knew that is still true for the oldest surviving range,
/// and tell the local cache which of its entries became current or obsolete.
fn fold_into_required(
    kept: &Arc<ObjectIndex>,
    compacted: &TransactionRange,
    local_client: &dyn LocalClient,
) {
    let since = compacted.highest_visible_tid();
    if !kept.is_complete_since(since) {
        debug!(
            "Coordinator::vacuum: kept chain is not complete since tid={}, nothing folded",
            since
        );
        return;
    }

    let required = kept.get_oldest_transaction();

    let (seen, mergeable) = {
        let r = required.read();
        let seen = compacted
            .items()
            .map(|(oid, tid)| (oid, tid, r.get(oid)))
            .collect::<Vec<_>>();
        (seen, r.covers(since))
    };

    let mut invalid: Vec<Oid> = vec![];
    let mut frozen = OidTidMap::new();
    for (oid, tid, newer) in seen {
        match newer {
            Some(newer) if newer != tid => invalid.push(oid),
            Some(_) => {}
            None => {
                if !kept.contains(oid) {
                    frozen.insert(oid, tid);
                }
            }
        }
    }

    if mergeable {
        let copied = required.write().merge_older_tid(compacted);
        debug!("Coordinator::vacuum: copied {} entries into required range", copied);
    }

    if !invalid.is_empty() {
        local_client.invalidate_all(&invalid);
    }
    if !frozen.is_empty() {
        local_client.freeze(&frozen);
    }
}

/// Detach every attached viewer at the oldest tid, unless that is the head tid.
///
/// Returns the number of viewers detached.
fn detach_furthest_behind(state: &mut State, head_tid: Tid) -> usize {
    let viewers = state.live_viewers();

    let oldest = viewers
        .iter()
        .filter_map(|v| v.state().attached_tid())
        .filter(|tid| *tid < head_tid)
        .min();

    let Some(oldest) = oldest else {
        return 0;
    };

    let mut detached = 0;
    for v in viewers.iter() {
        let mut vs = v.state();
        if vs.attached_tid() == Some(oldest) {
            vs.detach();
            detached += 1;
        }
    }

    warn!(
        "Coordinator::vacuum: detached {} viewer(s) at tid={}, head is at tid={}",
        detached, oldest, head_tid
    );
    detached
}
