// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Growable shared memory segments.
//!
//! A POSIX segment cannot be resized under the feet of processes that have
//! it mapped, so a [`Dshm`] grows by creating a new, bigger segment and
//! migrating the data into it. A small control segment publishes which
//! generation is current; data segments are named after their generation.
//!
//! Each process holds a [`DshmRef`] caching the generation it has mapped.
//! [`Dshm::validate_ref`] is a single atomic load, and a stale reference is
//! remapped by [`DshmGuard::mapping`] before use.

use crate::error::{Result, ShmemError};
use crate::key::ShmKey;
use crate::mem_handle::{MappedMem, NamedShmHandle};
use crate::mutex::{ShmMutex, ShmMutexGuard, DEFAULT_LOCK_TIMEOUT};
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MAGIC: [u8; 8] = *b"dddshm01";

/// Moves the data of the old segment (`src`) into the new, bigger one
/// (`dst`). Structures that store absolute addresses fix them up here.
pub type CopyFn = fn(dst: &mut [u8], src: &[u8]) -> anyhow::Result<()>;

/// A [`CopyFn`] for position independent data.
pub fn copy_bytes(dst: &mut [u8], src: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(dst.len() >= src.len(), "segment cannot shrink");
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

#[repr(C)]
struct Control {
    magic: [u8; 8],
    mutex: ShmMutex,
    generation: AtomicU64,
    size: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefState {
    Valid,
    Stale,
}

/// A process-local view of a [`Dshm`] segment.
#[derive(Debug, Default)]
pub struct DshmRef {
    generation: u64,
    mem: Option<MappedMem>,
}

impl DshmRef {
    /// The generation this reference has mapped, 0 if none.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct Dshm {
    key: ShmKey,
    control: MappedMem,
    copy: CopyFn,
    owner: bool,
    lock_timeout: Duration,
}

// SAFETY: shared state is only touched through atomics and the control mutex.
unsafe impl Send for Dshm {}
unsafe impl Sync for Dshm {}

fn control_key(key: &ShmKey) -> ShmKey {
    key.with_suffix("c")
}

fn data_key(key: &ShmKey, generation: u64) -> ShmKey {
    key.with_suffix(&generation.to_string())
}

impl Dshm {
    /// Creates the segment with its first generation of `size` zeroed bytes.
    /// The segments are removed when the returned value is dropped.
    pub fn create(key: &ShmKey, size: usize, copy: CopyFn) -> Result<Dshm> {
        if size == 0 {
            return Err(ShmemError::InvalidSize(size));
        }
        let control = NamedShmHandle::create(&control_key(key), mem::size_of::<Control>())?.map()?;
        if let Err(e) = NamedShmHandle::create(&data_key(key, 1), size) {
            _ = NamedShmHandle::unlink(&control_key(key));
            return Err(e);
        }
        // SAFETY: fresh zeroed mapping of at least size_of::<Control>() bytes.
        unsafe {
            let ctl = control.as_ptr().as_ptr() as *mut Control;
            (*ctl).mutex.init();
            (*ctl).size.store(size as u64, Ordering::Relaxed);
            (*ctl).generation.store(1, Ordering::Release);
            (*ctl).magic = MAGIC;
        }
        tracing::debug!("Created growable segment {key} of {size} bytes");
        Ok(Dshm {
            key: key.clone(),
            control,
            copy,
            owner: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Opens a segment created by another process.
    pub fn open(key: &ShmKey, copy: CopyFn) -> Result<Dshm> {
        let control = NamedShmHandle::open(&control_key(key))?.map()?;
        if control.get_size() < mem::size_of::<Control>() {
            return Err(ShmemError::Corrupted);
        }
        let dshm = Dshm {
            key: key.clone(),
            control,
            copy,
            owner: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };
        if dshm.control().magic != MAGIC {
            return Err(ShmemError::Corrupted);
        }
        Ok(dshm)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn control(&self) -> &Control {
        // SAFETY: checked size on open, initialized on create.
        unsafe { &*(self.control.as_ptr().as_ptr() as *const Control) }
    }

    pub fn key(&self) -> &ShmKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.control().generation.load(Ordering::Acquire)
    }

    /// Size of the current generation. Exact only under the lock.
    pub fn size(&self) -> usize {
        self.control().size.load(Ordering::Acquire) as usize
    }

    pub fn lock(&self) -> Result<DshmGuard<'_>> {
        let lock = self.control().mutex.lock(self.lock_timeout)?;
        Ok(DshmGuard {
            dshm: self,
            _lock: lock,
        })
    }

    /// A reference mapping the current generation.
    pub fn new_ref(&self) -> Result<DshmRef> {
        let mut local = DshmRef::default();
        self.reattach(&mut local)?;
        Ok(local)
    }

    pub fn validate_ref(&self, local: &DshmRef) -> RefState {
        if local.mem.is_some() && local.generation == self.generation() {
            RefState::Valid
        } else {
            RefState::Stale
        }
    }

    /// Maps the current generation into `local` if it is stale.
    pub fn reattach(&self, local: &mut DshmRef) -> Result<()> {
        if self.validate_ref(local) == RefState::Valid {
            return Ok(());
        }
        self.lock()?.attach(local)
    }

    /// Removes the segments. Processes that have them mapped keep their
    /// mappings.
    pub fn destroy(mut self) -> Result<()> {
        self.owner = false;
        let generation = self.generation();
        NamedShmHandle::unlink(&data_key(&self.key, generation))?;
        NamedShmHandle::unlink(&control_key(&self.key))
    }
}

impl Drop for Dshm {
    fn drop(&mut self) {
        if self.owner {
            _ = NamedShmHandle::unlink(&data_key(&self.key, self.generation()));
            _ = NamedShmHandle::unlink(&control_key(&self.key));
        }
    }
}

/// Holds the segment lock: no generation change can happen meanwhile.
pub struct DshmGuard<'a> {
    dshm: &'a Dshm,
    _lock: ShmMutexGuard<'a>,
}

impl DshmGuard<'_> {
    fn control(&self) -> &Control {
        self.dshm.control()
    }

    pub fn generation(&self) -> u64 {
        self.control().generation.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.control().size.load(Ordering::Relaxed) as usize
    }

    fn attach(&self, local: &mut DshmRef) -> Result<()> {
        let generation = self.generation();
        let size = self.size();
        let mem = NamedShmHandle::open(&data_key(&self.dshm.key, generation))?.map()?;
        if mem.get_size() < size {
            return Err(ShmemError::Corrupted);
        }
        if local.generation != 0 {
            tracing::debug!(
                "Reattaching {} from generation {} to {generation}",
                self.dshm.key,
                local.generation
            );
        }
        local.mem = Some(mem);
        local.generation = generation;
        Ok(())
    }

    /// The current data, remapping `local` first if it is stale.
    pub fn mapping<'r>(&'r self, local: &'r mut DshmRef) -> Result<&'r mut [u8]> {
        if local.mem.is_none() || local.generation != self.generation() {
            self.attach(local)?;
        }
        let size = self.size();
        match local.mem.as_mut() {
            Some(mem) => Ok(&mut mem.as_slice_mut()[..size]),
            None => Err(ShmemError::Corrupted),
        }
    }

    /// Moves the data into a new segment of `new_size` bytes and publishes
    /// it. On failure the current generation stays published and intact.
    pub fn realloc(&self, new_size: usize) -> Result<()> {
        let old_generation = self.generation();
        let old_size = self.size();
        let new_generation = old_generation + 1;
        let new_key = data_key(&self.dshm.key, new_generation);

        let migrate = || -> Result<()> {
            let mut new_mem = NamedShmHandle::create(&new_key, new_size)?.map()?;
            let old_mem = NamedShmHandle::open(&data_key(&self.dshm.key, old_generation))?.map()?;
            let src = old_mem
                .as_slice()
                .get(..old_size)
                .ok_or(ShmemError::Corrupted)?;
            (self.dshm.copy)(new_mem.as_slice_mut(), src).map_err(ShmemError::Migration)
        };
        if let Err(e) = migrate() {
            _ = NamedShmHandle::unlink(&new_key);
            tracing::warn!(
                "Cannot grow {} from {old_size} to {new_size} bytes: {e}",
                self.dshm.key
            );
            return Err(ShmemError::GrowFailed {
                size: new_size,
                source: Box::new(e),
            });
        }

        let control = self.control();
        control.size.store(new_size as u64, Ordering::Relaxed);
        control.generation.store(new_generation, Ordering::Release);
        if let Err(e) = NamedShmHandle::unlink(&data_key(&self.dshm.key, old_generation)) {
            tracing::debug!("Failed to remove old generation {old_generation}: {e}");
        }
        tracing::debug!(
            "Grew {} from {old_size} to {new_size} bytes, generation {new_generation}",
            self.dshm.key
        );
        Ok(())
    }
}
