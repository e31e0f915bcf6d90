// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_shmem::ShmemError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ValueCacheError>;

#[derive(Debug, Error)]
pub enum ValueCacheError {
    #[error(transparent)]
    Shmem(#[from] ShmemError),

    /// The history store could not serve a read.
    #[error("history store read failed")]
    Store(#[source] anyhow::Error),

    #[error("value cache is disabled")]
    Disabled,

    #[error("value cache has no shared memory key to attach to")]
    NotShared,

    #[error("unknown value type {0}")]
    UnknownValueType(u8),
}
