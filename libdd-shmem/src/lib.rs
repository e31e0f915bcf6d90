// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Caching structures shared by independently forked worker processes.
//!
//! - [`Arena`]: a general purpose heap over one fixed block, usually a named POSIX shared memory
//!   segment, guarded by a mutex that lives inside the block.
//! - [`HashSet`]: a chained hash set over any [`ShmAlloc`], either process-private memory or an
//!   arena.
//! - [`StringPool`]: reference counted string interning in its own shared arena.
//! - [`Dshm`]: a segment that grows by migrating its data into a bigger one while other
//!   processes keep working with their [`DshmRef`]s.
//!
//! Shared structures link their parts with offsets ([`RelPtr`]) rather than
//! addresses, so every process may map a segment wherever it likes. Running
//! out of space is an ordinary, recoverable [`ShmemError::OutOfSpace`].

pub mod allocator;
pub mod arena;
pub mod config;
pub mod dshm;
pub mod error;
pub mod hashset;
pub mod key;
pub mod mem_handle;
pub mod mutex;
pub mod strpool;

pub use allocator::{HeapAlloc, RelPtr, ShmAlloc};
pub use arena::{required_size, Arena, ArenaGuard, ArenaStats, BucketStats};
pub use config::Config;
pub use dshm::{copy_bytes, CopyFn, Dshm, DshmGuard, DshmRef, RefState};
pub use error::{Result, ShmemError};
pub use hashset::{BytesOps, HashSet, IdOps, SetOps};
pub use key::{ShmKey, STRING_POOL_PROJ_ID, VALUE_CACHE_PROJ_ID};
pub use mutex::{ShmMutex, ShmMutexGuard, DEFAULT_LOCK_TIMEOUT};
pub use strpool::{InternTable, RawStr, StrHandle, StringPool};
