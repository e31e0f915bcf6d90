// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pluggable allocation for structures that may live in shared memory.
//!
//! Shared structures store [`RelPtr`]s instead of addresses: for an arena the
//! value is an offset from the arena base, so the structure stays valid
//! wherever each process maps the segment. Only the allocator knows how to
//! [`resolve`](ShmAlloc::resolve) one into a local pointer.

use crate::error::{Result, ShmemError};
use allocator_api2::alloc::{Allocator, Global};
use core::alloc::Layout;
use core::num::NonZeroU64;
use core::ptr::NonNull;

/// A position independent pointer handed out by a [`ShmAlloc`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPtr(NonZeroU64);

impl RelPtr {
    #[inline]
    pub const fn new(raw: u64) -> Option<RelPtr> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(RelPtr(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encodes an optional pointer for storage in shared memory, 0 is none.
    #[inline]
    pub fn encode(ptr: Option<RelPtr>) -> u64 {
        ptr.map_or(0, RelPtr::get)
    }

    #[inline]
    pub fn offset(self, bytes: usize) -> RelPtr {
        RelPtr(self.0.saturating_add(bytes as u64))
    }
}

/// Allocation functions for [`HashSet`](crate::HashSet) and friends.
///
/// # Safety
/// Implementations must return non-overlapping blocks of at least the
/// requested size, 8-byte aligned, that stay valid until freed.
pub unsafe trait ShmAlloc {
    fn malloc(&self, size: usize) -> Result<RelPtr>;

    /// Resizes `ptr`. On failure the original allocation is left untouched.
    ///
    /// # Safety
    /// `ptr` must be live and come from this allocator.
    unsafe fn realloc(&self, ptr: RelPtr, size: usize) -> Result<RelPtr>;

    /// # Safety
    /// `ptr` must be live and come from this allocator. It is dead afterwards.
    unsafe fn free(&self, ptr: RelPtr);

    fn resolve(&self, ptr: RelPtr) -> NonNull<u8>;
}

unsafe impl<A: ShmAlloc + ?Sized> ShmAlloc for &A {
    #[inline]
    fn malloc(&self, size: usize) -> Result<RelPtr> {
        (**self).malloc(size)
    }

    #[inline]
    unsafe fn realloc(&self, ptr: RelPtr, size: usize) -> Result<RelPtr> {
        (**self).realloc(ptr, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: RelPtr) {
        (**self).free(ptr)
    }

    #[inline]
    fn resolve(&self, ptr: RelPtr) -> NonNull<u8> {
        (**self).resolve(ptr)
    }
}

/// Process-private allocation through the global allocator. Pointers are
/// plain addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAlloc;

const PREFIX: usize = 8;

impl HeapAlloc {
    fn layout(size: usize) -> Result<Layout> {
        size.checked_add(PREFIX)
            .and_then(|total| Layout::from_size_align(total, 8).ok())
            .ok_or(ShmemError::InvalidSize(size))
    }

    /// # Safety
    /// `ptr` must come from [`HeapAlloc::malloc`].
    unsafe fn base_and_layout(ptr: RelPtr) -> (NonNull<u8>, Layout) {
        let base = (ptr.get() as usize - PREFIX) as *mut u8;
        let size = core::ptr::read(base as *const u64) as usize;
        (
            NonNull::new_unchecked(base),
            Layout::from_size_align_unchecked(size + PREFIX, 8),
        )
    }
}

unsafe impl ShmAlloc for HeapAlloc {
    fn malloc(&self, size: usize) -> Result<RelPtr> {
        let layout = Self::layout(size)?;
        let block = Global
            .allocate(layout)
            .map_err(|_| ShmemError::OutOfSpace {
                requested: size,
                free: 0,
            })?
            .cast::<u8>();
        // SAFETY: block has room for the size prefix and is 8-byte aligned.
        unsafe {
            core::ptr::write(block.as_ptr() as *mut u64, size as u64);
            let data = block.as_ptr().add(PREFIX) as usize as u64;
            Ok(RelPtr::new(data).unwrap_unchecked())
        }
    }

    unsafe fn realloc(&self, ptr: RelPtr, size: usize) -> Result<RelPtr> {
        let new_layout = Self::layout(size)?;
        let (base, old_layout) = Self::base_and_layout(ptr);
        let block = if new_layout.size() >= old_layout.size() {
            Global.grow(base, old_layout, new_layout)
        } else {
            Global.shrink(base, old_layout, new_layout)
        }
        .map_err(|_| ShmemError::OutOfSpace {
            requested: size,
            free: 0,
        })?
        .cast::<u8>();
        core::ptr::write(block.as_ptr() as *mut u64, size as u64);
        let data = block.as_ptr().add(PREFIX) as usize as u64;
        Ok(RelPtr::new(data).unwrap_unchecked())
    }

    unsafe fn free(&self, ptr: RelPtr) {
        let (base, layout) = Self::base_and_layout(ptr);
        Global.deallocate(base, layout);
    }

    #[inline]
    fn resolve(&self, ptr: RelPtr) -> NonNull<u8> {
        // SAFETY: heap pointers are addresses, never zero.
        unsafe { NonNull::new_unchecked(ptr.get() as usize as *mut u8) }
    }
}
