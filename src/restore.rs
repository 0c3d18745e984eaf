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

//! Check a local cache that outlived its process against the database.

use std::io;
use std::time::Duration;

use log::info;
use log::warn;

use crate::adapter::ObjectMover;
use crate::batch::BatchError;
use crate::batch::RowBatcher;
use crate::coordinator::CoordinatorStats;
use crate::local_client::LocalClient;
use crate::Coordinator;
use crate::Oid;
use crate::OidTidMap;

/// The outcome of [`Coordinator::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Cached oids whose cached tid is still current.
    pub verified: OidTidMap,
    /// Cached oids that were removed: changed, deleted or not checked in time.
    pub invalid: Vec<Oid>,
    /// The deadline passed before every oid was checked.
    pub timed_out: bool,
}

impl Coordinator {
    /// Keep only the entries of `local_client` that are still current in the database.
    ///
    /// Oids are checked in batches of
    /// [`restore_batch_size`](crate::CoordinatorConfig::restore_batch_size). Once `timeout`,
    /// or the configured default, has passed, the remaining oids are treated as invalid.
    /// If the database fails, every cached oid is evicted and the error is returned.
    pub async fn restore<M>(
        &self,
        mover: &M,
        local_client: &dyn LocalClient,
        timeout: Option<Duration>,
    ) -> Result<RestoreReport, io::Error>
    where
        M: ObjectMover + ?Sized,
    {
        let oids = local_client.keys();
        if oids.is_empty() {
            return Ok(RestoreReport::default());
        }

        let batcher = RowBatcher::new(self.config().restore_batch_size)
            .with_timeout(timeout.or(self.config().restore_timeout))
            .with_clock(self.clock.clone());

        let (current, timed_out) = match batcher.select_current_tids(mover, &oids).await {
            Ok(current) => (current, false),
            Err(BatchError::Timeout(t)) => {
                warn!("Coordinator::restore: {}", t);
                CoordinatorStats::incr(&self.stats().restore_timeouts, 1);
                (t.partial_result, true)
            }
            Err(BatchError::Io(e)) => {
                warn!(
                    "Coordinator::restore: evicting all {} cached oids: {}",
                    oids.len(),
                    e
                );
                local_client.remove_invalid_persistent_oids(&oids);
                return Err(e);
            }
        };

        let mut report = RestoreReport {
            timed_out,
            ..Default::default()
        };

        for oid in oids {
            match current.get(&oid) {
                Some(tid) if local_client.contains_oid_with_tid(oid, *tid) => {
                    report.verified.insert(oid, *tid);
                }
                _ => report.invalid.push(oid),
            }
        }

        if !report.invalid.is_empty() {
            local_client.remove_invalid_persistent_oids(&report.invalid);
        }

        info!(
            "Coordinator::restore: verified={}, invalid={}, timed_out={}",
            report.verified.len(),
            report.invalid.len(),
            report.timed_out
        );

        Ok(report)
    }
}
