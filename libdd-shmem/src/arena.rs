// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A general purpose heap over one fixed block of (usually shared) memory.
//!
//! # Layout
//!
//! ```text
//! +-------------+-------+------------------+-------+-------+------------------+-------+
//! | ArenaHeader |  tag  | payload          |  tag  |  tag  | prev | next | .. |  tag  |
//! +-------------+-------+------------------+-------+-------+------------------+-------+
//!               ^ lo     used chunk                 free chunk                       ^ hi
//! ```
//!
//! Every chunk carries its total size in a boundary tag at both ends; the top
//! bit marks it used. Free chunks are kept in doubly linked lists, one per
//! size class: 29 exact classes spaced 8 bytes apart, and one class for
//! everything larger which is searched first-fit. Freed chunks are coalesced
//! with free neighbours immediately, so two free chunks are never adjacent.
//!
//! All links are offsets from the start of the block, which makes the heap
//! valid at any mapping address.

use crate::allocator::{RelPtr, ShmAlloc};
use crate::error::{Result, ShmemError};
use crate::key::ShmKey;
use crate::mem_handle::{MappedMem, NamedShmHandle};
use crate::mutex::{ShmMutex, ShmMutexGuard, DEFAULT_LOCK_TIMEOUT};
use allocator_api2::alloc::{Allocator, Global};
use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

const MAGIC: [u8; 8] = *b"ddshmem1";
const ALIGN: usize = 8;
const TAG: usize = 8;
const MIN_PAYLOAD: usize = 16;
const MIN_CHUNK: usize = MIN_PAYLOAD + 2 * TAG;
const BUCKETS: usize = 30;
const USED: u64 = 1 << 63;

#[repr(C)]
struct ArenaHeader {
    magic: [u8; 8],
    mutex: ShmMutex,
    region_size: u64,
    lo: u64,
    hi: u64,
    total_size: u64,
    free_size: u64,
    used_size: u64,
    root: u64,
    buckets: [u64; BUCKETS],
}

/// Bytes taken by the arena's own bookkeeping at the start of the block.
pub const HEADER_SIZE: usize = mem::size_of::<ArenaHeader>();

const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(mem::align_of::<ArenaHeader>() <= ALIGN);

/// Payload size actually reserved for a request of `size` bytes.
#[inline]
fn normalize(size: usize) -> Option<usize> {
    let size = size.max(MIN_PAYLOAD);
    size.checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}

#[inline]
fn bucket_of(chunk_size: u64) -> usize {
    (((chunk_size as usize).saturating_sub(MIN_CHUNK)) / ALIGN).min(BUCKETS - 1)
}

/// Bytes an arena needs to hold `count` allocations of `avg_size` bytes.
///
/// Accounts for the header and the per-chunk tags. Padding for fragmentation
/// is the caller's decision.
pub fn required_size(count: usize, avg_size: usize, label: &str) -> usize {
    let chunk = normalize(avg_size)
        .and_then(|payload| payload.checked_add(2 * TAG))
        .unwrap_or(usize::MAX);
    let size = count
        .max(1)
        .saturating_mul(chunk)
        .saturating_add(HEADER_SIZE);
    tracing::debug!("{label}: {count} elements of {avg_size} bytes require {size} bytes");
    size
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    /// Smallest chunk size held by this class.
    pub chunk_size: usize,
    pub chunks: usize,
    pub bytes: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaStats {
    pub total_size: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub max_free_chunk: usize,
    /// Free runs per size class, non-empty classes only.
    pub buckets: Vec<BucketStats>,
}

/// The heap algorithm over a raw block. Callers provide exclusion.
#[derive(Clone, Copy)]
struct Heap {
    base: *mut u8,
}

impl Heap {
    #[inline]
    fn header(self) -> *mut ArenaHeader {
        self.base as *mut ArenaHeader
    }

    #[inline]
    unsafe fn read(self, off: u64) -> u64 {
        ptr::read(self.base.add(off as usize) as *const u64)
    }

    #[inline]
    unsafe fn write(self, off: u64, val: u64) {
        ptr::write(self.base.add(off as usize) as *mut u64, val)
    }

    #[inline]
    unsafe fn set_tags(self, off: u64, size: u64, used: bool) {
        let tag = if used { size | USED } else { size };
        self.write(off, tag);
        self.write(off + size - TAG as u64, tag);
    }

    unsafe fn init(self, len: usize) {
        let h = self.header();
        ptr::write_bytes(self.base, 0, HEADER_SIZE);
        (*h).mutex.init();
        let hi = (len & !(ALIGN - 1)) as u64;
        (*h).region_size = len as u64;
        (*h).lo = HEADER_SIZE as u64;
        self.reset(hi);
        (*h).magic = MAGIC;
    }

    /// Re-initializes the bookkeeping so `[lo, hi)` is one free chunk.
    unsafe fn reset(self, hi: u64) {
        let h = self.header();
        let lo = (*h).lo;
        (*h).hi = hi;
        (*h).buckets = [0; BUCKETS];
        (*h).root = 0;
        (*h).total_size = hi - lo;
        (*h).used_size = 0;
        (*h).free_size = hi - lo;
        self.push_free(lo, hi - lo);
    }

    unsafe fn push_free(self, off: u64, size: u64) {
        let h = self.header();
        self.set_tags(off, size, false);
        let bucket = bucket_of(size);
        let head = (*h).buckets[bucket];
        self.write(off + 8, 0);
        self.write(off + 16, head);
        if head != 0 {
            self.write(head + 8, off);
        }
        (*h).buckets[bucket] = off;
    }

    unsafe fn unlink_free(self, off: u64, size: u64) {
        let h = self.header();
        let prev = self.read(off + 8);
        let next = self.read(off + 16);
        if prev != 0 {
            self.write(prev + 16, next);
        } else {
            (*h).buckets[bucket_of(size)] = next;
        }
        if next != 0 {
            self.write(next + 8, prev);
        }
    }

    /// Merges a free run with free neighbours and files it.
    unsafe fn insert_coalescing(self, mut off: u64, mut size: u64) {
        let h = self.header();
        if off > (*h).lo {
            let prev_tag = self.read(off - TAG as u64);
            if prev_tag & USED == 0 {
                off -= prev_tag;
                self.unlink_free(off, prev_tag);
                size += prev_tag;
            }
        }
        let next = off + size;
        if next < (*h).hi {
            let next_tag = self.read(next);
            if next_tag & USED == 0 {
                self.unlink_free(next, next_tag);
                size += next_tag;
            }
        }
        self.push_free(off, size);
    }

    unsafe fn find_free(self, need: u64) -> Option<u64> {
        let h = self.header();
        let first = bucket_of(need);
        for bucket in first..BUCKETS - 1 {
            let head = (*h).buckets[bucket];
            if head != 0 {
                return Some(head);
            }
        }
        let mut off = (*h).buckets[BUCKETS - 1];
        while off != 0 {
            if self.read(off) >= need {
                return Some(off);
            }
            off = self.read(off + 16);
        }
        None
    }

    /// Marks `[off, off + size)` used for a `need` byte chunk, returning the
    /// split-off tail to the free lists.
    unsafe fn carve(self, off: u64, size: u64, need: u64) -> u64 {
        let used = if size - need >= MIN_CHUNK as u64 {
            self.push_free(off + need, size - need);
            need
        } else {
            size
        };
        self.set_tags(off, used, true);
        used
    }

    unsafe fn malloc(self, size: usize) -> Option<u64> {
        let h = self.header();
        let need = (normalize(size)?.checked_add(2 * TAG)?) as u64;
        let off = self.find_free(need)?;
        let chunk = self.read(off);
        self.unlink_free(off, chunk);
        let used = self.carve(off, chunk, need);
        (*h).used_size += used;
        (*h).free_size -= used;
        Some(off + TAG as u64)
    }

    unsafe fn free(self, payload: u64) {
        let h = self.header();
        let off = payload - TAG as u64;
        let tag = self.read(off);
        debug_assert!(tag & USED != 0, "double free of arena offset {payload}");
        let size = tag & !USED;
        (*h).used_size -= size;
        (*h).free_size += size;
        self.insert_coalescing(off, size);
    }

    /// Resizes in place when possible. `None` means the caller has to move
    /// the data; nothing has been changed in that case.
    unsafe fn realloc_in_place(self, payload: u64, size: usize) -> Option<u64> {
        let h = self.header();
        let off = payload - TAG as u64;
        let chunk = self.read(off) & !USED;
        let need = (normalize(size)?.checked_add(2 * TAG)?) as u64;

        if need <= chunk {
            if chunk - need >= MIN_CHUNK as u64 {
                self.set_tags(off, need, true);
                (*h).used_size -= chunk - need;
                (*h).free_size += chunk - need;
                self.insert_coalescing(off + need, chunk - need);
            }
            return Some(payload);
        }

        let next = off + chunk;
        if next < (*h).hi {
            let next_tag = self.read(next);
            if next_tag & USED == 0 && chunk + next_tag >= need {
                self.unlink_free(next, next_tag);
                let used = self.carve(off, chunk + next_tag, need);
                (*h).used_size += used - chunk;
                (*h).free_size -= used - chunk;
                return Some(payload);
            }
        }
        None
    }

    unsafe fn payload_size(self, payload: u64) -> usize {
        ((self.read(payload - TAG as u64) & !USED) as usize) - 2 * TAG
    }

    /// Hands `[hi, new_hi)` to the heap after the block was enlarged.
    unsafe fn extend(self, new_hi: u64) {
        let h = self.header();
        let hi = (*h).hi;
        if new_hi <= hi || new_hi - hi < MIN_CHUNK as u64 {
            return;
        }
        let added = new_hi - hi;
        (*h).hi = new_hi;
        (*h).total_size += added;
        (*h).free_size += added;
        self.insert_coalescing(hi, added);
    }

    unsafe fn stats(self) -> ArenaStats {
        let h = self.header();
        let mut stats = ArenaStats {
            total_size: (*h).total_size as usize,
            used_size: (*h).used_size as usize,
            free_size: (*h).free_size as usize,
            ..Default::default()
        };
        let mut per_bucket = [(0usize, 0usize); BUCKETS];
        let mut off = (*h).lo;
        while off < (*h).hi {
            let tag = self.read(off);
            let size = tag & !USED;
            if size == 0 {
                break;
            }
            if tag & USED != 0 {
                stats.used_chunks += 1;
            } else {
                stats.free_chunks += 1;
                stats.max_free_chunk = stats.max_free_chunk.max(size as usize);
                let entry = &mut per_bucket[bucket_of(size)];
                entry.0 += 1;
                entry.1 += size as usize;
            }
            off += size;
        }
        stats.buckets = per_bucket
            .iter()
            .enumerate()
            .filter(|(_, (chunks, _))| *chunks > 0)
            .map(|(bucket, &(chunks, bytes))| BucketStats {
                chunk_size: MIN_CHUNK + bucket * ALIGN,
                chunks,
                bytes,
            })
            .collect();
        stats
    }

    /// Walks the whole heap checking tags, accounting and free lists.
    unsafe fn verify(self) -> bool {
        let h = self.header();
        let (lo, hi) = ((*h).lo, (*h).hi);
        let (mut used, mut free, mut free_chunks) = (0u64, 0u64, 0usize);
        let mut prev_free = false;
        let mut off = lo;
        while off < hi {
            let tag = self.read(off);
            let size = tag & !USED;
            if size < MIN_CHUNK as u64 || off + size > hi || self.read(off + size - 8) != tag {
                return false;
            }
            if tag & USED != 0 {
                used += size;
                prev_free = false;
            } else {
                if prev_free {
                    return false;
                }
                free += size;
                free_chunks += 1;
                prev_free = true;
            }
            off += size;
        }
        let mut listed = 0;
        for bucket in 0..BUCKETS {
            let mut node = (*h).buckets[bucket];
            let mut prev = 0;
            while node != 0 {
                let tag = self.read(node);
                if tag & USED != 0 || bucket_of(tag) != bucket || self.read(node + 8) != prev {
                    return false;
                }
                listed += 1;
                prev = node;
                node = self.read(node + 16);
            }
        }
        off == hi
            && used == (*h).used_size
            && free == (*h).free_size
            && used + free == (*h).total_size
            && listed == free_chunks
    }
}

enum Backing {
    Private(Layout),
    Shared { _mem: MappedMem, key: ShmKey, owner: bool },
    External,
}

/// A fixed block of memory managed as a heap.
///
/// All heap operations go through [`ArenaGuard`], obtained with
/// [`Arena::lock`]. The lock lives in the block itself, so it serializes
/// every process attached to a shared arena.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
    label: String,
    param: Option<String>,
    lock_timeout: Duration,
}

// SAFETY: all access to the block goes through the in-block mutex.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena of `size` bytes. With a key the block is a new named
    /// shared memory segment that other processes can [`attach`](Self::attach)
    /// to and that is removed when this arena is dropped; without one it is
    /// process-private memory.
    ///
    /// `param` names the configuration setting that sizes this arena, for
    /// out-of-space diagnostics.
    pub fn create(
        key: Option<&ShmKey>,
        size: usize,
        label: &str,
        param: Option<&str>,
    ) -> Result<Arena> {
        let min = HEADER_SIZE + MIN_CHUNK;
        if size < min {
            return Err(ShmemError::RegionTooSmall { size, min });
        }
        let (base, backing) = match key {
            Some(key) => {
                let mem = NamedShmHandle::create(key, size)?.map()?;
                (
                    mem.as_ptr(),
                    Backing::Shared {
                        _mem: mem,
                        key: key.clone(),
                        owner: true,
                    },
                )
            }
            None => {
                let layout =
                    Layout::from_size_align(size, ALIGN).map_err(|_| ShmemError::InvalidSize(size))?;
                let block = Global.allocate_zeroed(layout).map_err(|_| ShmemError::OutOfSpace {
                    requested: size,
                    free: 0,
                })?;
                (block.cast(), Backing::Private(layout))
            }
        };
        // SAFETY: base points at `size` writable bytes nobody else uses yet.
        unsafe { Heap { base: base.as_ptr() }.init(size) };
        tracing::debug!("Created arena {label} of {size} bytes, key {key:?}");
        Ok(Arena {
            base,
            len: size,
            backing,
            label: label.to_owned(),
            param: param.map(str::to_owned),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Attaches to an arena another process created with a key.
    pub fn attach(key: &ShmKey, label: &str) -> Result<Arena> {
        let mem = NamedShmHandle::open(key)?.map()?;
        let base = mem.as_ptr();
        let len = mem.get_size();
        // SAFETY: the mapping covers `len` bytes.
        unsafe { Self::check_header(base, len)? };
        tracing::debug!("Attached to arena {label} at {key}");
        Ok(Arena {
            base,
            len,
            backing: Backing::Shared {
                _mem: mem,
                key: key.clone(),
                owner: false,
            },
            label: label.to_owned(),
            param: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Initializes a new arena inside a caller-owned region.
    ///
    /// # Safety
    /// `region` must be writable, 8-byte aligned, and must outlive the
    /// returned arena. Nobody else may use the region concurrently with the
    /// initialization.
    pub unsafe fn init_in(region: NonNull<[u8]>, label: &str) -> Result<Arena> {
        let len = region.len();
        let min = HEADER_SIZE + MIN_CHUNK;
        if len < min {
            return Err(ShmemError::RegionTooSmall { size: len, min });
        }
        let base = region.cast::<u8>();
        if base.as_ptr() as usize % ALIGN != 0 {
            return Err(ShmemError::Corrupted);
        }
        Heap { base: base.as_ptr() }.init(len);
        Ok(Self::external(base, len, label))
    }

    /// Attaches to an arena already initialized inside `region`.
    ///
    /// # Safety
    /// Same as [`init_in`](Self::init_in), minus the exclusivity requirement.
    pub unsafe fn attach_in(region: NonNull<[u8]>, label: &str) -> Result<Arena> {
        let base = region.cast::<u8>();
        Self::check_header(base, region.len())?;
        Ok(Self::external(base, region.len(), label))
    }

    fn external(base: NonNull<u8>, len: usize, label: &str) -> Arena {
        Arena {
            base,
            len,
            backing: Backing::External,
            label: label.to_owned(),
            param: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    unsafe fn check_header(base: NonNull<u8>, len: usize) -> Result<()> {
        if len < HEADER_SIZE || base.as_ptr() as usize % ALIGN != 0 {
            return Err(ShmemError::Corrupted);
        }
        let h = base.as_ptr() as *const ArenaHeader;
        if (*h).magic != MAGIC || (*h).lo != HEADER_SIZE as u64 || (*h).hi > len as u64 {
            return Err(ShmemError::Corrupted);
        }
        Ok(())
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.param = Some(param.to_owned());
        self
    }

    pub fn lock(&self) -> Result<ArenaGuard<'_>> {
        let lock = self.header_mutex().lock(self.lock_timeout)?;
        Ok(ArenaGuard {
            arena: self,
            _lock: lock,
        })
    }

    fn header_mutex(&self) -> &ShmMutex {
        // SAFETY: the header is initialized and the mutex is only accessed
        // through atomics.
        unsafe { &(*(self.base.as_ptr() as *const ArenaHeader)).mutex }
    }

    fn heap(&self) -> Heap {
        Heap {
            base: self.base.as_ptr(),
        }
    }

    /// Resolves an allocation without taking the lock. Only for data that
    /// does not change while the caller holds it, such as interned strings.
    pub fn resolve(&self, ptr: RelPtr) -> NonNull<u8> {
        debug_assert!((ptr.get() as usize) < self.len);
        // SAFETY: offsets handed out by this arena are inside the block.
        unsafe { self.base.add(ptr.get() as usize) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of the underlying block.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn key(&self) -> Option<&ShmKey> {
        match &self.backing {
            Backing::Shared { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Locks and returns the current statistics.
    pub fn stats(&self) -> Result<ArenaStats> {
        Ok(self.lock()?.stats())
    }

    /// Copy callback for [`Dshm`](crate::Dshm) segments holding an arena:
    /// copies the block and turns the added tail into free space.
    pub fn copy_grow(dst: &mut [u8], src: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            dst.len() >= src.len(),
            "cannot shrink an arena from {} to {} bytes",
            src.len(),
            dst.len()
        );
        dst[..src.len()].copy_from_slice(src);
        let base = NonNull::from(&mut *dst).cast::<u8>();
        // SAFETY: dst is a live, exclusively borrowed block.
        unsafe {
            Self::check_header(base, src.len())?;
            let heap = Heap {
                base: base.as_ptr(),
            };
            let h = heap.header();
            (*h).mutex.init();
            (*h).region_size = dst.len() as u64;
            heap.extend((dst.len() & !(ALIGN - 1)) as u64);
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Private(layout) => {
                // SAFETY: allocated in `create` with this layout.
                unsafe { Global.deallocate(self.base, *layout) }
            }
            Backing::Shared {
                key, owner: true, ..
            } => {
                if let Err(e) = NamedShmHandle::unlink(key) {
                    tracing::debug!("Failed to remove arena segment {key}: {e}");
                }
            }
            _ => {}
        }
    }
}

/// Exclusive access to an [`Arena`]'s heap.
pub struct ArenaGuard<'a> {
    arena: &'a Arena,
    _lock: ShmMutexGuard<'a>,
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        let level: Level = $level;
        if level == Level::ERROR {
            tracing::error!($($arg)+)
        } else if level == Level::WARN {
            tracing::warn!($($arg)+)
        } else if level == Level::INFO {
            tracing::info!($($arg)+)
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

impl ArenaGuard<'_> {
    pub fn arena(&self) -> &Arena {
        self.arena
    }

    fn heap(&self) -> Heap {
        self.arena.heap()
    }

    fn header(&self) -> *mut ArenaHeader {
        self.heap().header()
    }

    pub fn total_size(&self) -> usize {
        // SAFETY: header fields are only written under the lock we hold.
        unsafe { (*self.header()).total_size as usize }
    }

    pub fn used_size(&self) -> usize {
        // SAFETY: as in `total_size`.
        unsafe { (*self.header()).used_size as usize }
    }

    pub fn free_size(&self) -> usize {
        // SAFETY: as in `total_size`.
        unsafe { (*self.header()).free_size as usize }
    }

    /// The top-level structure of the arena, as registered by its creator.
    pub fn root(&self) -> Option<RelPtr> {
        // SAFETY: as in `total_size`.
        RelPtr::new(unsafe { (*self.header()).root })
    }

    pub fn set_root(&self, root: Option<RelPtr>) {
        // SAFETY: the root slot is only written under the lock we hold.
        unsafe { (*self.header()).root = RelPtr::encode(root) }
    }

    /// Usable bytes behind a live allocation, at least what was requested.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this arena.
    pub unsafe fn usable_size(&self, ptr: RelPtr) -> usize {
        self.heap().payload_size(ptr.get())
    }

    /// Discards every allocation. Pointers handed out before are dead.
    pub fn clear(&self) {
        // SAFETY: we hold the lock; hi is unchanged.
        unsafe {
            let hi = (*self.header()).hi;
            self.heap().reset(hi);
        }
        tracing::debug!("Cleared arena {}", self.arena.label);
    }

    pub fn stats(&self) -> ArenaStats {
        unsafe { self.heap().stats() }
    }

    /// Checks the internal consistency of the heap.
    pub fn verify(&self) -> Result<()> {
        if unsafe { self.heap().verify() } {
            Ok(())
        } else {
            Err(ShmemError::Corrupted)
        }
    }

    pub fn dump_stats(&self, level: Level) {
        let label = &self.arena.label;
        let stats = self.stats();
        log_at!(
            level,
            "=== arena {label} statistics: size {} used {} free {} ===",
            stats.total_size,
            stats.used_size,
            stats.free_size
        );
        log_at!(
            level,
            "chunks: used {} free {} largest free {}",
            stats.used_chunks,
            stats.free_chunks,
            stats.max_free_chunk
        );
        for bucket in &stats.buckets {
            log_at!(
                level,
                "free chunks of size >= {}: {} ({} bytes)",
                bucket.chunk_size,
                bucket.chunks,
                bucket.bytes
            );
        }
    }

    fn out_of_space(&self, requested: usize) -> ShmemError {
        let free = self.free_size();
        match &self.arena.param {
            Some(param) => tracing::debug!(
                "Arena {}: cannot allocate {requested} bytes, {free} free; please increase {param}",
                self.arena.label
            ),
            None => tracing::debug!(
                "Arena {}: cannot allocate {requested} bytes, {free} free",
                self.arena.label
            ),
        }
        ShmemError::OutOfSpace { requested, free }
    }
}

unsafe impl ShmAlloc for ArenaGuard<'_> {
    fn malloc(&self, size: usize) -> Result<RelPtr> {
        // SAFETY: we hold the lock.
        unsafe { self.heap().malloc(size) }
            .and_then(RelPtr::new)
            .ok_or_else(|| self.out_of_space(size))
    }

    unsafe fn realloc(&self, ptr: RelPtr, size: usize) -> Result<RelPtr> {
        let heap = self.heap();
        if let Some(off) = heap.realloc_in_place(ptr.get(), size) {
            return RelPtr::new(off).ok_or(ShmemError::Corrupted);
        }
        let old_size = heap.payload_size(ptr.get());
        let new = self.malloc(size)?;
        ptr::copy_nonoverlapping(
            self.resolve(ptr).as_ptr(),
            self.resolve(new).as_ptr(),
            old_size.min(size),
        );
        heap.free(ptr.get());
        Ok(new)
    }

    unsafe fn free(&self, ptr: RelPtr) {
        self.heap().free(ptr.get())
    }

    #[inline]
    fn resolve(&self, ptr: RelPtr) -> NonNull<u8> {
        self.arena.resolve(ptr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bolero::generator::TypeGenerator;

    pub(crate) fn private(size: usize) -> Arena {
        Arena::create(None, size, "test", Some("TestCacheSize")).unwrap()
    }

    #[test]
    fn fresh_arena_is_one_free_run() {
        let arena = private(4096);
        let guard = arena.lock().unwrap();
        let stats = guard.stats();
        assert_eq!(stats.total_size, 4096 - HEADER_SIZE);
        assert_eq!(stats.free_size, stats.total_size);
        assert_eq!(stats.used_size, 0);
        assert_eq!(stats.free_chunks, 1);
        guard.verify().unwrap();
    }

    #[test]
    fn too_small() {
        assert!(matches!(
            Arena::create(None, HEADER_SIZE, "tiny", None),
            Err(ShmemError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn sized_for_ten() -> Result<()> {
        let arena = private(required_size(10, 64, "ten"));
        let guard = arena.lock()?;
        let ptrs: Vec<_> = (0..10).map(|_| guard.malloc(64)).collect::<Result<_>>()?;
        assert_eq!(guard.free_size(), 0);
        let err = guard.malloc(64).unwrap_err();
        assert!(err.is_out_of_space());
        for p in ptrs {
            unsafe { guard.free(p) };
        }
        assert_eq!(guard.used_size(), 0);
        assert_eq!(guard.stats().free_chunks, 1);
        guard.verify()
    }

    #[test]
    fn coalescing() -> Result<()> {
        let arena = private(4096);
        let guard = arena.lock()?;
        let a = guard.malloc(100)?;
        let b = guard.malloc(100)?;
        let c = guard.malloc(100)?;
        unsafe {
            guard.free(a);
            guard.free(c);
            assert_eq!(guard.stats().free_chunks, 2);
            guard.free(b);
        }
        assert_eq!(guard.stats().free_chunks, 1);
        guard.verify()
    }

    #[test]
    fn malloc_free_restores_state() -> Result<()> {
        let arena = private(8192);
        let guard = arena.lock()?;
        let keep = guard.malloc(48)?;
        let before = guard.stats();
        let p = guard.malloc(200)?;
        unsafe { guard.free(p) };
        assert_eq!(guard.stats(), before);
        unsafe { guard.free(keep) };
        Ok(())
    }

    #[test]
    fn realloc_paths() -> Result<()> {
        let arena = private(4096);
        let guard = arena.lock()?;
        let p = guard.malloc(32)?;
        unsafe {
            ptr::write_bytes(guard.resolve(p).as_ptr(), 7, 32);
            // Grows into the free tail.
            let q = guard.realloc(p, 256)?;
            assert_eq!(p, q);
            // Shrinks in place.
            let q = guard.realloc(q, 16)?;
            assert_eq!(p, q);
            let blocker = guard.malloc(16)?;
            // Must move now.
            let r = guard.realloc(q, 512)?;
            assert_ne!(q, r);
            assert_eq!(*guard.resolve(r).as_ptr().add(15), 7);
            guard.free(blocker);
            guard.free(r);
        }
        assert_eq!(guard.used_size(), 0);
        guard.verify()
    }

    #[test]
    fn failed_realloc_keeps_original() -> Result<()> {
        let arena = private(1024);
        let guard = arena.lock()?;
        let p = guard.malloc(64)?;
        let _blocker = guard.malloc(16)?;
        let used = guard.used_size();
        let err = unsafe { guard.realloc(p, 4096) }.unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(guard.used_size(), used);
        unsafe { guard.free(p) };
        guard.verify()
    }

    #[test]
    fn clear_and_root() -> Result<()> {
        let arena = private(4096);
        let guard = arena.lock()?;
        let p = guard.malloc(100)?;
        guard.set_root(Some(p));
        assert_eq!(guard.root(), Some(p));
        guard.clear();
        assert_eq!(guard.root(), None);
        assert_eq!(guard.used_size(), 0);
        guard.dump_stats(Level::DEBUG);
        guard.verify()
    }

    #[test]
    fn stats_serialize() {
        let arena = private(4096);
        let stats = arena.stats().unwrap();
        let json = serde_json::to_string(&stats).unwrap();
        let back: ArenaStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }

    #[test]
    fn copy_grow_extends() -> Result<()> {
        let mut small = vec![0u64; 128];
        let mut big = vec![0u64; 1024];
        let small_bytes = unsafe {
            core::slice::from_raw_parts_mut(small.as_mut_ptr() as *mut u8, small.len() * 8)
        };
        let arena = unsafe { Arena::init_in(NonNull::from(&mut *small_bytes), "grow")? };
        let p = {
            let guard = arena.lock()?;
            let p = guard.malloc(40)?;
            unsafe { ptr::write_bytes(guard.resolve(p).as_ptr(), 9, 40) };
            p
        };
        drop(arena);

        let big_bytes =
            unsafe { core::slice::from_raw_parts_mut(big.as_mut_ptr() as *mut u8, big.len() * 8) };
        Arena::copy_grow(big_bytes, small_bytes).unwrap();
        let grown = unsafe { Arena::attach_in(NonNull::from(&mut *big_bytes), "grow")? };
        let guard = grown.lock()?;
        assert_eq!(guard.total_size(), 8192 - HEADER_SIZE);
        assert_eq!(unsafe { *guard.resolve(p).as_ptr().add(39) }, 9);
        guard.malloc(4096)?;
        guard.verify()
    }

    #[test]
    fn attach_rejects_garbage() {
        let mut block = vec![0u64; 128];
        let region = NonNull::from(unsafe {
            core::slice::from_raw_parts_mut(block.as_mut_ptr() as *mut u8, 1024)
        });
        assert!(matches!(
            unsafe { Arena::attach_in(region, "garbage") },
            Err(ShmemError::Corrupted)
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn shared_arena_attach() -> Result<()> {
        let key = crate::mem_handle::tests::test_key("arena");
        let owner = Arena::create(Some(&key), 64 * 1024, "owner", None)?;
        let p = {
            let guard = owner.lock()?;
            let p = guard.malloc(8)?;
            unsafe { ptr::write(guard.resolve(p).as_ptr() as *mut u64, 42) };
            guard.set_root(Some(p));
            p
        };
        let other = Arena::attach(&key, "other")?;
        let guard = other.lock()?;
        assert_eq!(guard.root(), Some(p));
        assert_eq!(unsafe { ptr::read(guard.resolve(p).as_ptr() as *const u64) }, 42);
        drop(guard);
        drop(other);
        drop(owner);
        assert!(Arena::attach(&key, "gone").is_err());
        Ok(())
    }

    #[test]
    fn fuzz() {
        let ops = Vec::<(u8, u16, u16, u8)>::produce();
        bolero::check!()
            .with_generator(ops)
            .for_each(|ops: &Vec<(u8, u16, u16, u8)>| {
                let arena = private(32 * 1024);
                let guard = arena.lock().unwrap();
                let mut live: Vec<(RelPtr, usize, u8)> = Vec::new();
                for &(op, size, idx, val) in ops {
                    let size = size as usize % 2048;
                    match op % 3 {
                        0 | 1 if op % 3 == 0 || live.is_empty() => {
                            if let Ok(p) = guard.malloc(size) {
                                unsafe { ptr::write_bytes(guard.resolve(p).as_ptr(), val, size) };
                                live.push((p, size, val));
                            }
                        }
                        1 => {
                            let i = idx as usize % live.len();
                            let (p, old, val) = live[i];
                            if let Ok(q) = unsafe { guard.realloc(p, size) } {
                                unsafe {
                                    let data = guard.resolve(q).as_ptr();
                                    for j in 0..old.min(size) {
                                        assert_eq!(*data.add(j), val);
                                    }
                                    ptr::write_bytes(data, val, size);
                                }
                                live[i] = (q, size, val);
                            }
                        }
                        _ => {
                            if !live.is_empty() {
                                let (p, size, val) = live.swap_remove(idx as usize % live.len());
                                unsafe {
                                    let data = guard.resolve(p).as_ptr();
                                    for j in 0..size {
                                        assert_eq!(*data.add(j), val);
                                    }
                                    guard.free(p);
                                }
                            }
                        }
                    }
                    assert_eq!(guard.used_size() + guard.free_size(), guard.total_size());
                }
                guard.verify().unwrap();
                for (p, _, _) in live {
                    unsafe { guard.free(p) };
                }
                assert_eq!(guard.used_size(), 0);
            });
    }
}
