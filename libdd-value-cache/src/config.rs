// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_shmem::config::parse_size;
use libdd_shmem::DEFAULT_LOCK_TIMEOUT;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const ENV_SIZE: &str = "_DD_VALUE_CACHE_SIZE";
const DEFAULT_SIZE: usize = 8 << 20;

/// Seconds since the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

#[derive(Debug, Clone)]
pub struct ValueCacheConfig {
    /// Arena size in bytes. 0 disables the cache, every read goes to the
    /// history store.
    pub size: usize,
    /// Identifier of the shared segment. Without one the cache lives in
    /// process-private memory.
    pub key_path: Option<PathBuf>,
    pub lock_timeout: Duration,
    /// Source of the current time, for item expiry and low memory periods.
    pub clock: fn() -> i64,
}

impl Default for ValueCacheConfig {
    fn default() -> Self {
        ValueCacheConfig {
            size: DEFAULT_SIZE,
            key_path: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            clock: unix_now,
        }
    }
}

impl ValueCacheConfig {
    /// A shared cache sized by `_DD_VALUE_CACHE_SIZE`, keyed and locked like
    /// the rest of the shared memory settings.
    pub fn get() -> Self {
        let shmem = libdd_shmem::Config::get();
        ValueCacheConfig {
            size: FromEnv::size(),
            key_path: Some(shmem.key_path),
            lock_timeout: shmem.lock_timeout,
            clock: unix_now,
        }
    }

    pub fn private(size: usize) -> Self {
        ValueCacheConfig {
            size,
            ..Default::default()
        }
    }
}

struct FromEnv {}

impl FromEnv {
    fn size() -> usize {
        std::env::var(ENV_SIZE)
            .ok()
            .and_then(|value| parse_size(&value))
            .unwrap_or(DEFAULT_SIZE)
    }
}
