// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! POSIX shared memory segments and their mappings.

use crate::error::{Result, ShmemError};
use crate::key::ShmKey;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

/// An open, named shared memory object.
#[derive(Debug)]
pub struct NamedShmHandle {
    fd: OwnedFd,
    size: usize,
    key: ShmKey,
}

/// A live `MAP_SHARED` mapping of a [`NamedShmHandle`]. Unmapped on drop.
#[derive(Debug)]
pub struct MappedMem {
    ptr: NonNull<c_void>,
    handle: NamedShmHandle,
}

// SAFETY: the mapping is plain shared memory; synchronization of its contents
// is the job of the structures placed inside it.
unsafe impl Send for MappedMem {}
unsafe impl Sync for MappedMem {}

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

impl NamedShmHandle {
    /// Creates a fresh segment of `size` bytes. A leftover segment with the
    /// same name (from a crashed previous run) is removed first.
    pub fn create(key: &ShmKey, size: usize) -> Result<NamedShmHandle> {
        if size == 0 {
            return Err(ShmemError::InvalidSize(size));
        }
        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP;
        let fd = match shm_open(key.as_c_str(), flags, mode) {
            Err(Errno::EEXIST) => {
                tracing::debug!("Removing leftover shared memory segment {key}");
                _ = shm_unlink(key.as_c_str());
                shm_open(key.as_c_str(), flags, mode)
            }
            other => other,
        }
        .map_err(|e| ShmemError::segment(key.name(), e))?;

        if let Err(e) = ftruncate(&fd, page_aligned_size(size) as libc::off_t) {
            _ = shm_unlink(key.as_c_str());
            return Err(ShmemError::segment(key.name(), e));
        }
        Ok(NamedShmHandle {
            fd,
            size,
            key: key.clone(),
        })
    }

    /// Opens an existing segment. Its usable size is the size of the object.
    pub fn open(key: &ShmKey) -> Result<NamedShmHandle> {
        let fd = shm_open(key.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ShmemError::segment(key.name(), e))?;
        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| ShmemError::segment(key.name(), e))?
            .len() as usize;
        Ok(NamedShmHandle {
            fd: file.into(),
            size,
            key: key.clone(),
        })
    }

    /// Removes the name. Existing mappings stay valid until unmapped.
    pub fn unlink(key: &ShmKey) -> Result<()> {
        shm_unlink(key.as_c_str()).map_err(|e| ShmemError::segment(key.name(), e))
    }

    pub fn map(self) -> Result<MappedMem> {
        let len = NonZeroUsize::new(self.size).ok_or(ShmemError::InvalidSize(self.size))?;
        // SAFETY: mapping a shared memory object we hold open; the kernel
        // picks the address.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                0,
            )
        }
        .map_err(|e| ShmemError::segment(self.key.name(), e))?;
        Ok(MappedMem { ptr, handle: self })
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn key(&self) -> &ShmKey {
        &self.key
    }
}

impl MappedMem {
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers `size` bytes while self is alive.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.get_size()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and we hold the only Rust reference to the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.get_size()) }
    }

    pub fn as_region(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.as_ptr(), self.get_size())
    }

    pub fn get_size(&self) -> usize {
        self.handle.size
    }

    pub fn key(&self) -> &ShmKey {
        &self.handle.key
    }
}

impl Drop for MappedMem {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in `map`.
        unsafe {
            _ = munmap(self.ptr, self.handle.size);
        }
    }
}
