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

//! # MVCC Cache Index
//!
//! A polling based MVCC index that tracks, for every registered reader, which objects
//! changed since which transaction, while sharing the bulk of that history between readers.
//!
//! ## Core Components
//!
//! - [`TransactionRange`]: oid -> tid changes known between two transactions.
//! - [`ObjectIndex`]: a copy-on-write chain of [`TransactionRange`], newest first.
//! - [`Coordinator`]: the per-database owner of the shared chain and of the registered
//!   [`Viewer`]s. It polls, folds in deltas, vacuums and detaches diverged readers.
//! - [`Coordinator::restore`]: validates a reattached local cache against the database
//!   under a time budget.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::io;
//! use std::sync::Arc;
//!
//! use mvcc_cache_index::impls::memory_client::MemoryClient;
//! use mvcc_cache_index::Coordinator;
//! use mvcc_cache_index::Polled;
//! use mvcc_cache_index::Poller;
//! use mvcc_cache_index::Viewer;
//!
//! async fn poll_once<P: Poller>(poller: &P, cursor: &mut P::Cursor) -> io::Result<()> {
//!     let coordinator = Coordinator::default();
//!     let viewer = Arc::new(Viewer::new(Arc::new(MemoryClient::default())));
//!     coordinator.register(&viewer);
//!
//!     match coordinator.poll(&viewer, poller, cursor).await? {
//!         Polled::Changes(changes) => println!("changed: {:?}", changes),
//!         Polled::InvalidateAll => println!("drop everything"),
//!     }
//!
//!     coordinator.unregister(&viewer);
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::io;

use futures_util::stream::BoxStream;

pub mod adapter;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod impls;
pub mod local_client;
pub mod object_index;
pub mod restore;
pub mod viewer;

pub use crate::adapter::ObjectMover;
pub use crate::adapter::PolledChanges;
pub use crate::adapter::Poller;
pub use crate::config::CoordinatorConfig;
pub use crate::coordinator::Coordinator;
pub use crate::coordinator::Polled;
pub use crate::local_client::LocalClient;
pub use crate::object_index::ObjectIndex;
pub use crate::object_index::TransactionRange;
pub use crate::restore::RestoreReport;
pub use crate::viewer::Staleness;
pub use crate::viewer::Viewer;

/// Transaction id. Issued monotonically by the database; larger is later.
///
/// `0` means no transaction has been committed yet.
pub type Tid = u64;

/// Object id: the stable identifier of a stored object.
pub type Oid = u64;

/// Object id to the id of the transaction that last changed it.
pub type OidTidMap = BTreeMap<Oid, Tid>;

/// A boxed stream that yields `Result` of rows or an `io::Error`.
pub type IOResultStream<T> = BoxStream<'static, Result<T, io::Error>>;
