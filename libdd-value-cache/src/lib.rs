// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A read-through cache of recent item history, shared by worker processes
//! through a [`libdd_shmem::Arena`].
//!
//! Reads that the cache cannot serve go to a [`HistoryStore`]; what they
//! return is kept for the next reader. When the arena fills up the cache
//! evicts the items least worth keeping and reports `low_memory` in its
//! [`CacheStats`].

pub mod cache;
pub mod config;
pub mod error;
pub mod record;
pub mod store;

pub use cache::{CacheStats, ItemStats, ValueCache};
pub use config::ValueCacheConfig;
pub use error::{Result, ValueCacheError};
pub use record::{HistoryRecord, HistoryValue, LogValue, Timestamp, ValueType};
pub use store::{HistoryStore, MemoryStore};
