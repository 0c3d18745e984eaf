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

use crate::Oid;
use crate::Tid;

/// A [`TransactionRange`](crate::TransactionRange) or a chain of them violates its tid ordering.
///
/// These are programming errors: either this crate or an adapter feeding it produced
/// data that can not be true.
#[derive(Clone, PartialEq, Eq, thiserror::Error, Debug)]
pub enum InvalidRange {
    /// The lower bound of the complete interval must be below the upper bound.
    #[error("EmptyInterval: complete_since_tid={complete_since_tid} >= highest_visible_tid={highest_visible_tid}")]
    EmptyInterval {
        highest_visible_tid: Tid,
        complete_since_tid: Tid,
    },

    /// A recorded change is newer than the range can see.
    #[error("TooNew: oid={oid} tid={tid} > highest_visible_tid={highest_visible_tid}")]
    TooNew {
        oid: Oid,
        tid: Tid,
        highest_visible_tid: Tid,
    },

    /// Polled change data must lie inside the complete interval.
    #[error("TooOld: oid={oid} tid={tid} <= complete_since_tid={complete_since_tid}")]
    TooOld {
        oid: Oid,
        tid: Tid,
        complete_since_tid: Tid,
    },

    /// `merge_same_tid()` was given ranges at different tids.
    #[error("TidMismatch: this={this} other={other}")]
    TidMismatch { this: Tid, other: Tid },

    /// A poll result is older than the chain it is folded into.
    #[error("Regressed: polled={polled} < current={current}")]
    Regressed { polled: Tid, current: Tid },
}
