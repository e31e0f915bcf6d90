// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use crate::mutex::DEFAULT_LOCK_TIMEOUT;
use crate::strpool::StringPool;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

const ENV_KEY_PATH: &str = "_DD_SHMEM_KEY_PATH";
const DEFAULT_KEY_PATH: &str = "/tmp";

const ENV_LOCK_TIMEOUT_MS: &str = "_DD_SHMEM_LOCK_TIMEOUT_MS";

const ENV_STRING_POOL_SIZE: &str = "_DD_SHMEM_STRING_POOL_SIZE";
const DEFAULT_STRING_POOL_SIZE: usize = 16 << 20;

/// Parses a byte count with an optional `K`, `M` or `G` suffix.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 10),
        (i, 'm' | 'M') => (&value[..i], 20),
        (i, 'g' | 'G') => (&value[..i], 30),
        _ => (value, 0),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(1 << shift)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Stable path every cooperating process derives segment keys from.
    pub key_path: PathBuf,
    pub lock_timeout: Duration,
    pub string_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            string_pool_size: DEFAULT_STRING_POOL_SIZE,
        }
    }
}

impl Config {
    pub fn get() -> Self {
        FromEnv::config()
    }

    pub fn to_env(&self) -> HashMap<&'static str, OsString> {
        HashMap::from([
            (ENV_KEY_PATH, self.key_path.clone().into_os_string()),
            (
                ENV_LOCK_TIMEOUT_MS,
                self.lock_timeout.as_millis().to_string().into(),
            ),
            (
                ENV_STRING_POOL_SIZE,
                self.string_pool_size.to_string().into(),
            ),
        ])
    }

    /// Creates the shared string pool described by this configuration.
    pub fn create_string_pool(&self) -> Result<StringPool> {
        Ok(StringPool::create(&self.key_path, self.string_pool_size)?
            .with_lock_timeout(self.lock_timeout))
    }

    pub fn attach_string_pool(&self) -> Result<StringPool> {
        Ok(StringPool::attach(&self.key_path)?.with_lock_timeout(self.lock_timeout))
    }
}

pub struct FromEnv {}

impl FromEnv {
    fn key_path() -> PathBuf {
        std::env::var_os(ENV_KEY_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_PATH))
    }

    fn lock_timeout() -> Duration {
        std::env::var(ENV_LOCK_TIMEOUT_MS)
            .unwrap_or_default()
            .parse()
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT)
    }

    fn string_pool_size() -> usize {
        std::env::var(ENV_STRING_POOL_SIZE)
            .ok()
            .and_then(|value| parse_size(&value))
            .unwrap_or(DEFAULT_STRING_POOL_SIZE)
    }

    pub fn config() -> Config {
        Config {
            key_path: Self::key_path(),
            lock_timeout: Self::lock_timeout(),
            string_pool_size: Self::string_pool_size(),
        }
    }
}
