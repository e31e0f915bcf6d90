// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference counted string interning.
//!
//! [`InternTable`] is the bare table over any [`ShmAlloc`], for embedding in
//! another structure's arena. [`StringPool`] wraps one in its own shared
//! arena and hands out [`StrHandle`]s that release their reference on drop.
//!
//! An entry is a single allocation:
//!
//! ```text
//! +----------+---------+----------------+-----+
//! | refcount | len u32 | string bytes   | NUL |
//! +----------+---------+----------------+-----+
//!                       ^ RawStr
//! ```
//!
//! Hashing and comparison only look at the string bytes.

use crate::allocator::{RelPtr, ShmAlloc};
use crate::arena::{Arena, ArenaGuard, ArenaStats};
use crate::error::{Result, ShmemError};
use crate::hashset::{fnv1a, HashSet, SetOps};
use crate::key::{ShmKey, STRING_POOL_PROJ_ID};
use core::fmt;
use core::mem;
use core::ops::Deref;
use core::ptr;
use std::path::Path;
use std::time::Duration;

const ENTRY_HEADER: usize = 8;
const INIT_SLOTS: usize = 1021;
const SIZE_PARAM: &str = "_DD_SHMEM_STRING_POOL_SIZE";

#[derive(Clone, Copy, Debug, Default)]
pub struct StrEntryOps;

impl SetOps for StrEntryOps {
    type Key = str;

    fn hash(&self, key: &str) -> u64 {
        fnv1a(key.as_bytes())
    }

    fn matches(&self, entry: &[u8], key: &str) -> bool {
        entry.len() == ENTRY_HEADER + key.len() + 1
            && &entry[ENTRY_HEADER..entry.len() - 1] == key.as_bytes()
    }

    fn entry_size(&self, key: &str) -> usize {
        ENTRY_HEADER + key.len() + 1
    }

    fn init(&self, key: &str, entry: &mut [u8]) {
        // Refcount starts at 0 and the terminator is already zeroed.
        entry[4..8].copy_from_slice(&(key.len() as u32).to_ne_bytes());
        entry[ENTRY_HEADER..ENTRY_HEADER + key.len()].copy_from_slice(key.as_bytes());
    }
}

/// Position independent pointer to the bytes of an interned string.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawStr(RelPtr);

impl RawStr {
    pub fn to_bits(self) -> u64 {
        self.0.get()
    }

    pub fn from_bits(bits: u64) -> Option<RawStr> {
        RelPtr::new(bits).map(RawStr)
    }

    fn entry(self) -> RelPtr {
        RelPtr::new(self.0.get() - ENTRY_HEADER as u64).unwrap_or(self.0)
    }

    /// # Safety
    /// `base` must resolve this string's allocator and the string must be live.
    unsafe fn read<'a>(self, start: *const u8) -> &'a str {
        let len = ptr::read(start.sub(4) as *const u32) as usize;
        core::str::from_utf8_unchecked(core::slice::from_raw_parts(start, len))
    }

    unsafe fn refcount_ptr(self, start: *mut u8) -> *mut u32 {
        start.sub(ENTRY_HEADER) as *mut u32
    }
}

pub struct InternTable<A: ShmAlloc> {
    set: HashSet<A, StrEntryOps>,
}

impl<A: ShmAlloc> InternTable<A> {
    pub fn create(alloc: A, init_slots: usize) -> Result<Self> {
        Ok(InternTable {
            set: HashSet::create(alloc, init_slots, StrEntryOps)?,
        })
    }

    /// # Safety
    /// `header` must come from [`InternTable::header`] of a live table in `alloc`.
    pub unsafe fn attach(alloc: A, header: RelPtr) -> Self {
        InternTable {
            set: HashSet::attach(alloc, header, StrEntryOps),
        }
    }

    pub fn header(&self) -> RelPtr {
        self.set.header()
    }

    fn start(&self, raw: RawStr) -> *mut u8 {
        self.set.allocator().resolve(raw.0).as_ptr()
    }

    /// Interns `s` and takes one reference to it.
    pub fn intern(&mut self, s: &str) -> Result<RawStr> {
        let (entry, _) = self.set.insert(s)?;
        let raw = RawStr(entry.offset(ENTRY_HEADER));
        // SAFETY: entry is live, just found or inserted.
        unsafe { *raw.refcount_ptr(self.start(raw)) += 1 };
        Ok(raw)
    }

    /// Takes one more reference to a live string.
    ///
    /// # Safety
    /// `raw` must hold at least one reference in this table.
    pub unsafe fn acquire(&mut self, raw: RawStr) -> RawStr {
        let refcount = raw.refcount_ptr(self.start(raw));
        debug_assert!(*refcount > 0);
        *refcount += 1;
        raw
    }

    /// Drops one reference, removing the string with the last one. Returns
    /// whether it was removed.
    ///
    /// # Safety
    /// `raw` must hold a reference in this table, which is dead afterwards.
    pub unsafe fn release(&mut self, raw: RawStr) -> bool {
        let refcount = raw.refcount_ptr(self.start(raw));
        debug_assert!(*refcount > 0, "unbalanced release of {raw:?}");
        *refcount -= 1;
        if *refcount > 0 {
            return false;
        }
        self.set.remove_ptr(raw.entry());
        if self.set.is_empty() {
            self.set.clear();
        }
        true
    }

    /// Looks a string up without taking a reference.
    pub fn find(&self, s: &str) -> Option<RawStr> {
        self.set
            .search_ptr(s)
            .map(|entry| RawStr(entry.offset(ENTRY_HEADER)))
    }

    /// # Safety
    /// `raw` must be live in this table.
    pub unsafe fn get(&self, raw: RawStr) -> &str {
        raw.read(self.start(raw))
    }

    /// # Safety
    /// `raw` must be live in this table.
    pub unsafe fn refcount(&self, raw: RawStr) -> u32 {
        *raw.refcount_ptr(self.start(raw))
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Drops every string regardless of its references.
    pub fn clear(&mut self) {
        self.set.clear()
    }

    pub fn destroy(self) {
        self.set.destroy()
    }
}

/// A string pool in its own arena.
///
/// Every operation takes the arena lock for its duration. Handles borrow the
/// pool, so [`clear`](StringPool::clear) cannot run while this process still
/// holds one.
pub struct StringPool {
    arena: Arena,
}

impl StringPool {
    /// Creates the shared pool derived from `identifier`. Other processes
    /// reach it with [`attach`](Self::attach) and the same identifier.
    pub fn create(identifier: impl AsRef<Path>, size: usize) -> Result<StringPool> {
        let key = ShmKey::derive(identifier, STRING_POOL_PROJ_ID);
        let arena = Arena::create(Some(&key), size, "string pool", Some(SIZE_PARAM))?;
        Self::init(arena)
    }

    /// A pool in process-private memory.
    pub fn private(size: usize) -> Result<StringPool> {
        let arena = Arena::create(None, size, "string pool", Some(SIZE_PARAM))?;
        Self::init(arena)
    }

    pub fn attach(identifier: impl AsRef<Path>) -> Result<StringPool> {
        let key = ShmKey::derive(identifier, STRING_POOL_PROJ_ID);
        let arena = Arena::attach(&key, "string pool")?;
        // Fails on a pool whose creator has not finished initializing.
        arena.lock()?.root().ok_or(ShmemError::Corrupted)?;
        Ok(StringPool { arena })
    }

    fn init(arena: Arena) -> Result<StringPool> {
        {
            let guard = arena.lock()?;
            let table = InternTable::create(&guard, INIT_SLOTS)?;
            guard.set_root(Some(table.header()));
        }
        Ok(StringPool { arena })
    }

    pub fn with_lock_timeout(self, timeout: Duration) -> Self {
        StringPool {
            arena: self.arena.with_lock_timeout(timeout),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut InternTable<&ArenaGuard<'_>>) -> R) -> Result<R> {
        let guard = self.arena.lock()?;
        let root = guard.root().ok_or(ShmemError::Corrupted)?;
        // SAFETY: the root of a pool arena is always its table.
        let mut table = unsafe { InternTable::attach(&guard, root) };
        Ok(f(&mut table))
    }

    pub fn intern(&self, s: &str) -> Result<StrHandle<'_>> {
        let raw = self.with_table(|table| table.intern(s))??;
        Ok(StrHandle { pool: self, raw })
    }

    pub fn acquire(&self, handle: &StrHandle<'_>) -> Result<StrHandle<'_>> {
        self.check_owner(handle)?;
        // SAFETY: a live handle of this pool holds a reference.
        let raw = self.with_table(|table| unsafe { table.acquire(handle.raw) })?;
        Ok(StrHandle { pool: self, raw })
    }

    /// Releases a handle, reporting lock failures that dropping it would
    /// only log. A handle of another pool is dropped into its own pool.
    pub fn release(&self, handle: StrHandle<'_>) -> Result<()> {
        self.check_owner(&handle)?;
        let raw = handle.into_raw();
        // SAFETY: the handle owned this reference.
        self.with_table(|table| unsafe { table.release(raw) })?;
        Ok(())
    }

    fn check_owner(&self, handle: &StrHandle<'_>) -> Result<()> {
        if ptr::eq(handle.pool, self) {
            Ok(())
        } else {
            Err(ShmemError::ForeignHandle)
        }
    }

    /// References currently held on `s`, 0 when it is not interned.
    pub fn refcount(&self, s: &str) -> Result<u32> {
        self.with_table(|table| {
            table
                .find(s)
                // SAFETY: just found.
                .map_or(0, |raw| unsafe { table.refcount(raw) })
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.with_table(|table| table.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops every string and resets the arena. Raw handles kept by other
    /// structures must have been discarded first.
    pub fn clear(&mut self) -> Result<()> {
        let guard = self.arena.lock()?;
        guard.clear();
        let table = InternTable::create(&guard, INIT_SLOTS)?;
        guard.set_root(Some(table.header()));
        Ok(())
    }

    pub fn info(&self) -> Result<ArenaStats> {
        self.arena.stats()
    }

    /// # Safety
    /// `raw` must be live in this pool.
    unsafe fn read(&self, raw: RawStr) -> &str {
        raw.read(self.arena.resolve(raw.0).as_ptr())
    }
}

/// One reference to an interned string. Released on drop.
pub struct StrHandle<'p> {
    pool: &'p StringPool,
    raw: RawStr,
}

impl<'p> StrHandle<'p> {
    /// Gives up ownership without releasing, for storage in shared structures.
    pub fn into_raw(self) -> RawStr {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    /// # Safety
    /// `raw` must carry a reference in `pool` not owned by any other handle.
    pub unsafe fn from_raw(pool: &'p StringPool, raw: RawStr) -> Self {
        StrHandle { pool, raw }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: the string lives at least as long as our reference, and its
        // bytes never change.
        unsafe { self.pool.read(self.raw) }
    }

    pub fn raw(&self) -> RawStr {
        self.raw
    }
}

impl Deref for StrHandle<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for StrHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StrHandle").field(&self.as_str()).finish()
    }
}

impl Drop for StrHandle<'_> {
    fn drop(&mut self) {
        let raw = self.raw;
        // SAFETY: we own this reference.
        if let Err(e) = self.pool.with_table(|table| unsafe { table.release(raw) }) {
            tracing::error!("Failed to release interned string: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAlloc;
    use crate::arena::tests::private;

    #[test]
    fn intern_twice_shares_storage() -> Result<()> {
        let pool = StringPool::private(64 * 1024)?;
        let a = pool.intern("system.cpu.load")?;
        let b = pool.intern("system.cpu.load")?;
        assert_eq!(a.raw(), b.raw());
        assert_eq!(&*a, "system.cpu.load");
        assert_eq!(pool.refcount("system.cpu.load")?, 2);
        drop(a);
        assert_eq!(pool.refcount("system.cpu.load")?, 1);
        drop(b);
        assert_eq!(pool.refcount("system.cpu.load")?, 0);
        assert!(pool.is_empty()?);
        Ok(())
    }

    #[test]
    fn handles_stay_with_their_pool() -> Result<()> {
        let a = StringPool::private(64 * 1024)?;
        let b = StringPool::private(64 * 1024)?;
        let from_a = a.intern("from-pool-a")?;
        let _from_b = b.intern("from-pool-b")?;

        assert!(matches!(b.acquire(&from_a), Err(ShmemError::ForeignHandle)));
        assert_eq!(b.refcount("from-pool-b")?, 1);
        assert_eq!(a.refcount("from-pool-a")?, 1);

        assert!(matches!(b.release(from_a), Err(ShmemError::ForeignHandle)));
        assert_eq!(b.refcount("from-pool-b")?, 1);
        assert_eq!(a.refcount("from-pool-a")?, 0);
        Ok(())
    }

    #[test]
    fn acquire_and_explicit_release() -> Result<()> {
        let pool = StringPool::private(64 * 1024)?;
        let a = pool.intern("vfs.fs.size")?;
        let b = pool.acquire(&a)?;
        assert_eq!(pool.refcount("vfs.fs.size")?, 2);
        pool.release(a)?;
        assert_eq!(&*b, "vfs.fs.size");
        pool.release(b)?;
        assert_eq!(pool.len()?, 0);
        Ok(())
    }

    #[test]
    fn raw_round_trip() -> Result<()> {
        let pool = StringPool::private(64 * 1024)?;
        let raw = pool.intern("agent.ping")?.into_raw();
        assert_eq!(pool.refcount("agent.ping")?, 1);
        let bits = raw.to_bits();
        let handle = unsafe { StrHandle::from_raw(&pool, RawStr::from_bits(bits).unwrap()) };
        assert_eq!(handle.as_str(), "agent.ping");
        drop(handle);
        assert_eq!(pool.refcount("agent.ping")?, 0);
        Ok(())
    }

    #[test]
    fn empty_and_nul_strings() -> Result<()> {
        let pool = StringPool::private(64 * 1024)?;
        let empty = pool.intern("")?;
        let nul = pool.intern("a\0b")?;
        let a = pool.intern("a")?;
        assert_eq!(&*empty, "");
        assert_eq!(&*nul, "a\0b");
        assert_ne!(nul.raw(), a.raw());
        assert_eq!(pool.len()?, 3);
        Ok(())
    }

    #[test]
    fn emptied_pool_returns_to_initial_footprint() -> Result<()> {
        let pool = StringPool::private(1024 * 1024)?;
        let initial = pool.info()?.used_size;
        let handles: Vec<_> = (0..5000)
            .map(|i| pool.intern(&format!("key[{i}]")))
            .collect::<Result<_>>()?;
        assert!(pool.info()?.used_size > initial);
        drop(handles);
        assert_eq!(pool.info()?.used_size, initial);
        Ok(())
    }

    #[test]
    fn clear_resets() -> Result<()> {
        let mut pool = StringPool::private(64 * 1024)?;
        let initial = pool.info()?;
        pool.intern("a")?.into_raw();
        pool.intern("b")?.into_raw();
        pool.clear()?;
        assert_eq!(pool.len()?, 0);
        assert_eq!(pool.info()?.used_size, initial.used_size);
        Ok(())
    }

    #[test]
    fn out_of_space_is_reported() -> Result<()> {
        let pool = StringPool::private(16 * 1024)?;
        let long = "x".repeat(4096);
        let mut held = Vec::new();
        let err = loop {
            match pool.intern(&format!("{long}{}", held.len())) {
                Ok(h) => held.push(h),
                Err(e) => break e,
            }
        };
        assert!(err.is_out_of_space());
        assert!(!held.is_empty());
        Ok(())
    }

    #[test]
    fn table_over_heap_and_arena() -> Result<()> {
        let mut heap = InternTable::create(HeapAlloc, 3)?;
        let raw = heap.intern("heap")?;
        assert_eq!(unsafe { heap.get(raw) }, "heap");
        assert!(unsafe { heap.release(raw) });
        heap.destroy();

        let arena = private(16 * 1024);
        let guard = arena.lock()?;
        let mut table = InternTable::create(&guard, 3)?;
        let raw = table.intern("arena")?;
        assert_eq!(table.find("arena"), Some(raw));
        unsafe {
            assert_eq!(table.acquire(raw), raw);
            assert!(!table.release(raw));
            assert_eq!(table.refcount(raw), 1);
        }
        table.destroy();
        assert_eq!(guard.used_size(), 0);
        Ok(())
    }
}
