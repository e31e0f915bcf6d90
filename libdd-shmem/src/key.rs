// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic shared memory names.
//!
//! Processes that never talked to each other must agree on the name of a
//! segment. Like `ftok(3)`, a key is derived from a stable path plus a small
//! per-purpose id, so every process that knows both computes the same name.

use crate::hashset::fnv1a;
use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;

/// Purpose id of the global string pool segment.
pub const STRING_POOL_PROJ_ID: u8 = b's';
/// Purpose id of the value cache segment.
pub const VALUE_CACHE_PROJ_ID: u8 = b'v';

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShmKey {
    name: CString,
}

impl ShmKey {
    /// Derives a key from `identifier` and `proj_id`.
    ///
    /// The identifier is canonicalized when it names an existing path, so
    /// `/tmp/../tmp` and `/tmp` yield the same key.
    pub fn derive(identifier: impl AsRef<Path>, proj_id: u8) -> ShmKey {
        let path = identifier.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let hash = fnv1a(canonical.as_os_str().as_encoded_bytes());
        // Fold to 32 bits: macOS limits shm names to 31 characters.
        let folded = (hash ^ (hash >> 32)) as u32;
        Self::from_name(&format!("/ddshm-{folded:08x}-{proj_id:02x}"))
    }

    /// Returns a key for a sibling segment, e.g. the control block or one
    /// generation of a growable segment.
    pub fn with_suffix(&self, suffix: &str) -> ShmKey {
        let mut name = self.name.to_string_lossy().into_owned();
        name.push('-');
        name.push_str(suffix);
        Self::from_name(&name)
    }

    fn from_name(name: &str) -> ShmKey {
        // Names are built from hex digits and caller suffixes; interior NULs
        // are dropped rather than rejected.
        let bytes: Vec<u8> = name.bytes().filter(|&b| b != 0).collect();
        ShmKey {
            name: CString::new(bytes).unwrap_or_default(),
        }
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.name
    }

    pub fn name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }
}

impl fmt::Debug for ShmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShmKey").field(&self.name).finish()
    }
}

impl fmt::Display for ShmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = ShmKey::derive("/tmp", STRING_POOL_PROJ_ID);
        let b = ShmKey::derive("/tmp", STRING_POOL_PROJ_ID);
        assert_eq!(a, b);
        assert!(a.name().starts_with("/ddshm-"));
        assert!(a.name().len() <= 31);
    }

    #[test]
    fn proj_id_separates_purposes() {
        let pool = ShmKey::derive("/tmp", STRING_POOL_PROJ_ID);
        let cache = ShmKey::derive("/tmp", VALUE_CACHE_PROJ_ID);
        assert_ne!(pool, cache);
    }

    #[test]
    fn canonicalization() {
        let direct = ShmKey::derive("/tmp", 1);
        let dotted = ShmKey::derive("/tmp/../tmp", 1);
        assert_eq!(direct, dotted);
    }

    #[test]
    fn suffixes() {
        let key = ShmKey::derive("/tmp", 1);
        let ctl = key.with_suffix("c");
        assert_eq!(ctl.name(), format!("{}-c", key.name()));
        assert_ne!(key.with_suffix("1"), key.with_suffix("2"));
    }
}
