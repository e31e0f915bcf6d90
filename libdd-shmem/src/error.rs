// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmemError>;

#[derive(Debug, Error)]
pub enum ShmemError {
    /// The arena has no free run large enough for the request. Transient
    /// fragmentation makes this a normal outcome for a long-running cache.
    #[error("out of shared memory: requested {requested} bytes, {free} bytes free")]
    OutOfSpace { requested: usize, free: usize },

    /// A segment could not be grown. The previous segment is still published.
    #[error("cannot grow shared memory segment to {size} bytes")]
    GrowFailed {
        size: usize,
        #[source]
        source: Box<ShmemError>,
    },

    #[error("cannot create or attach shared memory segment {name}: {source}")]
    Segment {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {0:?} waiting for a shared memory lock")]
    LockTimeout(Duration),

    #[error("memory region of {size} bytes is too small, at least {min} bytes are required")]
    RegionTooSmall { size: usize, min: usize },

    #[error("shared memory region is not initialized or is corrupted")]
    Corrupted,

    /// A string handle was passed to a pool other than the one it came from.
    #[error("string handle belongs to another pool")]
    ForeignHandle,

    #[error("invalid size {0}")]
    InvalidSize(usize),

    #[error("segment data migration failed")]
    Migration(#[source] anyhow::Error),
}

impl ShmemError {
    /// Returns true for the resource exhaustion class of errors, which callers
    /// are expected to answer with eviction or back-pressure.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. } | Self::GrowFailed { .. })
    }

    pub(crate) fn segment(name: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Segment {
            name: name.into(),
            source: source.into(),
        }
    }
}
