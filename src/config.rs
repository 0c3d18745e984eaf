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

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Settings of a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// The number of ranges the shared chain may keep before the viewers furthest behind
    /// are detached.
    pub max_allowed_index_depth: usize,

    /// The number of oids checked by one query when restoring a local cache.
    pub restore_batch_size: usize,

    /// The time budget of a restore. `None` checks every cached oid.
    pub restore_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_allowed_index_depth: 100,
            restore_batch_size: 1000,
            restore_timeout: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_allowed_index_depth(mut self, depth: usize) -> Self {
        self.max_allowed_index_depth = depth.max(1);
        self
    }

    pub fn with_restore_batch_size(mut self, size: usize) -> Self {
        self.restore_batch_size = size.max(1);
        self
    }

    pub fn with_restore_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.restore_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default() {
        let c = CoordinatorConfig::default();
        assert_eq!(100, c.max_allowed_index_depth);
        assert_eq!(1000, c.restore_batch_size);
        assert_eq!(None, c.restore_timeout);
    }

    #[test]
    fn test_builder_clamps_to_one() {
        let c = CoordinatorConfig::default()
            .with_max_allowed_index_depth(0)
            .with_restore_batch_size(0)
            .with_restore_timeout(Some(Duration::from_secs(3)));

        assert_eq!(1, c.max_allowed_index_depth);
        assert_eq!(1, c.restore_batch_size);
        assert_eq!(Some(Duration::from_secs(3)), c.restore_timeout);
    }

    #[test]
    fn test_deserialize_partial() -> anyhow::Result<()> {
        let c: CoordinatorConfig = serde_json::from_str(r#"{"max_allowed_index_depth": 2}"#)?;
        assert_eq!(
            CoordinatorConfig::default().with_max_allowed_index_depth(2),
            c
        );
        Ok(())
    }
}
