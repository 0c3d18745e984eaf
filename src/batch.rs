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

//! Fetch rows for many oids in bounded batches under a deadline.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use futures_util::TryStreamExt;
use log::debug;

use crate::ObjectMover;
use crate::Oid;
use crate::OidTidMap;

/// A monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The deadline passed before every batch was fetched.
///
/// This is an expected outcome: `partial_result` holds every row fetched so far.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("AggregateTimeout: elapsed={elapsed:?} >= timeout={timeout:?}; checked {checked} of {total} oids")]
pub struct AggregateTimeout {
    pub elapsed: Duration,
    pub timeout: Duration,
    /// Number of oids sent to the database before giving up.
    pub checked: usize,
    pub total: usize,
    pub partial_result: OidTidMap,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Timeout(#[from] AggregateTimeout),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Splits a large lookup into queries of at most `batch_size` oids.
///
/// The deadline is checked between batches, so a query already sent is always completed
/// and the overrun is bounded by the latency of one batch.
pub struct RowBatcher {
    batch_size: usize,
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RowBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowBatcher")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RowBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            timeout: None,
            clock: Arc::new(MonotonicClock),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch the current tid of every oid in `oids` that exists in the database.
    pub async fn select_current_tids<M>(
        &self,
        mover: &M,
        oids: &[Oid],
    ) -> Result<OidTidMap, BatchError>
    where
        M: ObjectMover + ?Sized,
    {
        let started = self.clock.now();
        let mut found = OidTidMap::new();
        let mut checked = 0;

        let mut batches = oids.chunks(self.batch_size).peekable();

        while let Some(batch) = batches.next() {
            let mut rows = mover.current_object_tids(batch).await?;
            while let Some((oid, tid)) = rows.try_next().await? {
                found.insert(oid, tid);
            }
            checked += batch.len();

            let Some(timeout) = self.timeout else {
                continue;
            };

            if batches.peek().is_none() {
                break;
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed >= timeout {
                debug!(
                    "RowBatcher: timeout after {:?}, checked {} of {} oids",
                    elapsed,
                    checked,
                    oids.len()
                );
                return Err(AggregateTimeout {
                    elapsed,
                    timeout,
                    checked,
                    total: oids.len(),
                    partial_result: found,
                }
                .into());
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;
    use std::time::Instant;

    use futures_util::StreamExt;
    use parking_lot::Mutex;

    use super::Clock;
    use crate::IOResultStream;
    use crate::ObjectMover;
    use crate::Oid;
    use crate::Tid;

    /// A clock that returns scripted offsets, in seconds, from a fixed start.
    pub(crate) struct ScriptedClock {
        base: Instant,
        ticks: Mutex<VecDeque<u64>>,
    }

    impl ScriptedClock {
        pub(crate) fn new(ticks: impl IntoIterator<Item = u64>) -> Self {
            Self {
                base: Instant::now(),
                ticks: Mutex::new(ticks.into_iter().collect()),
            }
        }

        pub(crate) fn remaining(&self) -> usize {
            self.ticks.lock().len()
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> Instant {
            let secs = self.ticks.lock().pop_front().expect("clock read too many times");
            self.base + Duration::from_secs(secs)
        }
    }

    /// Serves rows from a map and records every batch it is asked for.
    #[derive(Default)]
    pub(crate) struct MapMover {
        pub(crate) rows: BTreeMap<Oid, Tid>,
        pub(crate) batches: Mutex<Vec<Vec<Oid>>>,
        pub(crate) fail: bool,
    }

    impl MapMover {
        pub(crate) fn new(rows: impl IntoIterator<Item = (Oid, Tid)>) -> Self {
            Self {
                rows: rows.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectMover for MapMover {
        async fn current_object_tids(
            &self,
            oids: &[Oid],
        ) -> Result<IOResultStream<(Oid, Tid)>, io::Error> {
            self.batches.lock().push(oids.to_vec());
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection lost"));
            }

            let rows = oids
                .iter()
                .filter_map(|oid| self.rows.get(oid).map(|tid| (*oid, *tid)))
                .collect::<Vec<_>>();
            Ok(futures::stream::iter(rows).map(Ok).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::testing::MapMover;
    use super::testing::ScriptedClock;
    use super::*;

    #[tokio::test]
    async fn test_select_all_without_timeout() -> anyhow::Result<()> {
        let mover = MapMover::new([(1, 1), (2, 5), (4, 4)]);
        let batcher = RowBatcher::new(2);

        let got = batcher.select_current_tids(&mover, &[1, 2, 3, 4, 5]).await?;

        assert_eq!(OidTidMap::from([(1, 1), (2, 5), (4, 4)]), got);
        assert_eq!(vec![vec![1, 2], vec![3, 4], vec![5]], *mover.batches.lock());
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_between_batches() {
        let oids = (1..=10).collect::<Vec<_>>();
        let mover = MapMover::new(oids.iter().map(|oid| (*oid, 1)));

        let clock = Arc::new(ScriptedClock::new([12345, 12346, 12347]));
        let batcher = RowBatcher::new(1)
            .with_timeout(Some(Duration::from_secs(2)))
            .with_clock(clock.clone());

        let res = batcher.select_current_tids(&mover, &oids).await;

        let Err(BatchError::Timeout(timeout)) = res else {
            panic!("expect timeout, got: {:?}", res);
        };

        assert_eq!(OidTidMap::from([(1, 1), (2, 1)]), timeout.partial_result);
        assert_eq!(2, timeout.checked);
        assert_eq!(10, timeout.total);
        assert_eq!(Duration::from_secs(2), timeout.elapsed);
        assert_eq!(2, mover.batches.lock().len());
        assert_eq!(0, clock.remaining());
    }

    #[tokio::test]
    async fn test_no_timeout_after_last_batch() -> anyhow::Result<()> {
        let mover = MapMover::new([(1, 3), (2, 3)]);

        // The clock is not read after the last batch: a third read would panic.
        let clock = Arc::new(ScriptedClock::new([0, 0]));
        let batcher = RowBatcher::new(1)
            .with_timeout(Some(Duration::from_secs(1)))
            .with_clock(clock);

        let got = batcher.select_current_tids(&mover, &[1, 2]).await?;
        assert_eq!(OidTidMap::from([(1, 3), (2, 3)]), got);
        Ok(())
    }

    #[tokio::test]
    async fn test_io_error() {
        let mover = MapMover {
            fail: true,
            ..Default::default()
        };
        let batcher = RowBatcher::new(10);

        let res = batcher.select_current_tids(&mover, &[1]).await;
        assert!(matches!(res, Err(BatchError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_empty_input() -> anyhow::Result<()> {
        let mover = MapMover::default();
        let batcher = RowBatcher::new(0);
        assert_eq!(1, batcher.batch_size());

        let got = batcher.select_current_tids(&mover, &[]).await?;
        assert!(got.is_empty());
        assert!(mover.batches.lock().is_empty());
        Ok(())
    }
}
