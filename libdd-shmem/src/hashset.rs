// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A chained hash set whose storage comes from a [`ShmAlloc`].
//!
//! The set itself is a small header plus a slot array of chain heads, all
//! allocated from the allocator and linked by [`RelPtr`]s, so a set created
//! inside a shared arena can be reopened by any process with
//! [`HashSet::attach`]. Entries are untyped byte blobs; a [`SetOps`]
//! implementation decides how keys are hashed, compared and written.
//!
//! Entries never move once inserted: growing the slot array relinks nodes
//! but keeps their storage, so entry pointers stay valid until removal.

use crate::allocator::{RelPtr, ShmAlloc};
use crate::error::{Result, ShmemError};
use core::mem;
use core::ptr;

/// FNV-1a. Hashes must be identical in every process sharing a set, which
/// rules out the randomized std hasher.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Hash, comparison and initialization of set entries.
pub trait SetOps {
    type Key: ?Sized;

    fn hash(&self, key: &Self::Key) -> u64;

    /// Whether the stored `entry` holds `key`.
    fn matches(&self, entry: &[u8], key: &Self::Key) -> bool;

    /// Bytes to allocate for a new entry holding `key`.
    fn entry_size(&self, key: &Self::Key) -> usize;

    /// Writes `key` into a zeroed new entry.
    fn init(&self, key: &Self::Key, entry: &mut [u8]);
}

/// Entries are the key bytes themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesOps;

impl SetOps for BytesOps {
    type Key = [u8];

    fn hash(&self, key: &[u8]) -> u64 {
        fnv1a(key)
    }

    fn matches(&self, entry: &[u8], key: &[u8]) -> bool {
        entry == key
    }

    fn entry_size(&self, key: &[u8]) -> usize {
        key.len()
    }

    fn init(&self, key: &[u8], entry: &mut [u8]) {
        entry.copy_from_slice(key);
    }
}

/// Entries of a fixed size starting with a `u64` id in native byte order.
#[derive(Clone, Copy, Debug)]
pub struct IdOps {
    pub entry_size: usize,
}

impl SetOps for IdOps {
    type Key = u64;

    fn hash(&self, key: &u64) -> u64 {
        fnv1a(&key.to_ne_bytes())
    }

    fn matches(&self, entry: &[u8], key: &u64) -> bool {
        entry.get(..8) == Some(&key.to_ne_bytes()[..])
    }

    fn entry_size(&self, _key: &u64) -> usize {
        self.entry_size.max(8)
    }

    fn init(&self, key: &u64, entry: &mut [u8]) {
        entry[..8].copy_from_slice(&key.to_ne_bytes());
    }
}

#[repr(C)]
struct SetHeader {
    slots: u64,
    num_slots: u64,
    num_data: u64,
    init_slots: u64,
}

#[repr(C)]
struct Node {
    next: u64,
    hash: u64,
    size: u64,
}

const NODE_SIZE: usize = mem::size_of::<Node>();

// Load factor 4/5, grow by 3/2.
const LOAD_NUM: u64 = 4;
const LOAD_DEN: u64 = 5;

fn next_prime(n: u64) -> u64 {
    fn is_prime(n: u64) -> bool {
        if n < 4 {
            return n > 1;
        }
        if n % 2 == 0 {
            return false;
        }
        let mut d = 3;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 2;
        }
        true
    }
    let mut n = n.max(2);
    while !is_prime(n) {
        n += 1;
    }
    n
}

pub struct HashSet<A: ShmAlloc, O: SetOps> {
    alloc: A,
    header: RelPtr,
    ops: O,
}

impl<A: ShmAlloc, O: SetOps> HashSet<A, O> {
    /// Creates an empty set with `init_size` slots.
    pub fn create(alloc: A, init_size: usize, ops: O) -> Result<Self> {
        let init_slots = init_size.max(1) as u64;
        let header = alloc.malloc(mem::size_of::<SetHeader>())?;
        let slots = match Self::alloc_slots(&alloc, init_slots) {
            Ok(slots) => slots,
            Err(e) => {
                // SAFETY: just allocated.
                unsafe { alloc.free(header) };
                return Err(e);
            }
        };
        let h = alloc.resolve(header).as_ptr() as *mut SetHeader;
        // SAFETY: header is a fresh allocation of the right size.
        unsafe {
            ptr::write(
                h,
                SetHeader {
                    slots: slots.get(),
                    num_slots: init_slots,
                    num_data: 0,
                    init_slots,
                },
            )
        };
        Ok(HashSet { alloc, header, ops })
    }

    /// Reopens a set previously created with the same kind of allocator.
    ///
    /// # Safety
    /// `header` must be the [`header`](Self::header) of a live set whose
    /// entries were written with compatible `ops`, reachable through `alloc`.
    pub unsafe fn attach(alloc: A, header: RelPtr, ops: O) -> Self {
        HashSet { alloc, header, ops }
    }

    /// Where the set lives, for storing in a parent structure.
    pub fn header(&self) -> RelPtr {
        self.header
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    fn alloc_slots(alloc: &A, count: u64) -> Result<RelPtr> {
        let bytes = (count as usize)
            .checked_mul(8)
            .ok_or(ShmemError::InvalidSize(count as usize))?;
        let slots = alloc.malloc(bytes)?;
        // SAFETY: fresh allocation of `bytes` bytes.
        unsafe { ptr::write_bytes(alloc.resolve(slots).as_ptr(), 0, bytes) };
        Ok(slots)
    }

    #[inline]
    fn hdr(&self) -> *mut SetHeader {
        self.alloc.resolve(self.header).as_ptr() as *mut SetHeader
    }

    #[inline]
    fn node(&self, node: u64) -> *mut Node {
        self.alloc.resolve(RelPtr::new(node).unwrap_or(self.header)).as_ptr() as *mut Node
    }

    #[inline]
    unsafe fn slot(&self, index: u64) -> *mut u64 {
        let slots = RelPtr::new((*self.hdr()).slots).unwrap_or(self.header);
        (self.alloc.resolve(slots).as_ptr() as *mut u64).add(index as usize)
    }

    #[inline]
    unsafe fn data<'s>(&'s self, node: u64) -> &'s [u8] {
        let n = self.node(node);
        core::slice::from_raw_parts((n as *const u8).add(NODE_SIZE), (*n).size as usize)
    }

    #[inline]
    unsafe fn data_mut<'s>(&'s mut self, node: u64) -> &'s mut [u8] {
        let n = self.node(node);
        core::slice::from_raw_parts_mut((n as *mut u8).add(NODE_SIZE), (*n).size as usize)
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.hdr()).num_data as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_slots(&self) -> usize {
        unsafe { (*self.hdr()).num_slots as usize }
    }

    fn find_node(&self, hash: u64, key: &O::Key) -> Option<u64> {
        // SAFETY: chains only link live nodes of this set.
        unsafe {
            let h = self.hdr();
            let mut node = *self.slot(hash % (*h).num_slots);
            while node != 0 {
                let n = self.node(node);
                if (*n).hash == hash && self.ops.matches(self.data(node), key) {
                    return Some(node);
                }
                node = (*n).next;
            }
        }
        None
    }

    /// Pointer to the entry holding `key`.
    pub fn search_ptr(&self, key: &O::Key) -> Option<RelPtr> {
        self.find_node(self.ops.hash(key), key)
            .and_then(|node| RelPtr::new(node + NODE_SIZE as u64))
    }

    pub fn search(&self, key: &O::Key) -> Option<&[u8]> {
        let node = self.find_node(self.ops.hash(key), key)?;
        Some(unsafe { self.data(node) })
    }

    pub fn search_mut(&mut self, key: &O::Key) -> Option<&mut [u8]> {
        let node = self.find_node(self.ops.hash(key), key)?;
        Some(unsafe { self.data_mut(node) })
    }

    /// Inserts `key` unless an equal entry exists. Returns the entry and
    /// whether it was created.
    pub fn insert(&mut self, key: &O::Key) -> Result<(RelPtr, bool)> {
        let hash = self.ops.hash(key);
        if let Some(node) = self.find_node(hash, key) {
            return Ok((entry_of(node)?, false));
        }
        let size = self.ops.entry_size(key);
        let total = NODE_SIZE
            .checked_add(size)
            .ok_or(ShmemError::InvalidSize(size))?;
        let node = self.alloc.malloc(total)?;
        // SAFETY: node is a fresh allocation of NODE_SIZE + size bytes.
        unsafe {
            let n = self.alloc.resolve(node).as_ptr() as *mut Node;
            let data = (n as *mut u8).add(NODE_SIZE);
            ptr::write_bytes(data, 0, size);
            self.ops
                .init(key, core::slice::from_raw_parts_mut(data, size));
            let h = self.hdr();
            let slot = self.slot(hash % (*h).num_slots);
            ptr::write(
                n,
                Node {
                    next: *slot,
                    hash,
                    size: size as u64,
                },
            );
            *slot = node.get();
            (*h).num_data += 1;
        }
        self.maybe_grow();
        Ok((node.offset(NODE_SIZE), true))
    }

    /// The bytes of an entry.
    ///
    /// # Safety
    /// `entry` must be a live entry of this set.
    pub unsafe fn entry(&self, entry: RelPtr) -> &[u8] {
        self.data(entry.get() - NODE_SIZE as u64)
    }

    /// # Safety
    /// `entry` must be a live entry of this set.
    pub unsafe fn entry_mut(&mut self, entry: RelPtr) -> &mut [u8] {
        self.data_mut(entry.get() - NODE_SIZE as u64)
    }

    /// Removes the entry holding `key`, returning whether it existed.
    pub fn remove(&mut self, key: &O::Key) -> bool {
        match self.search_ptr(key) {
            // SAFETY: just found in this set.
            Some(entry) => unsafe { self.remove_ptr(entry) },
            None => false,
        }
    }

    /// Removes an entry by pointer, without hashing its key again.
    ///
    /// # Safety
    /// `entry` must have been returned by this set. It is dead afterwards.
    pub unsafe fn remove_ptr(&mut self, entry: RelPtr) -> bool {
        let target = entry.get() - NODE_SIZE as u64;
        let h = self.hdr();
        let hash = (*self.node(target)).hash;
        let mut link = self.slot(hash % (*h).num_slots);
        while *link != 0 {
            let node = *link;
            let n = self.node(node);
            if node == target {
                *link = (*n).next;
                (*h).num_data -= 1;
                if let Some(node) = RelPtr::new(node) {
                    self.alloc.free(node);
                }
                return true;
            }
            link = ptr::addr_of_mut!((*n).next);
        }
        debug_assert!(false, "entry {entry:?} not found in its chain");
        false
    }

    pub fn iter(&self) -> Iter<'_, A, O> {
        Iter {
            set: self,
            slot: 0,
            node: 0,
        }
    }

    fn maybe_grow(&mut self) {
        let (num_data, num_slots) = unsafe { ((*self.hdr()).num_data, (*self.hdr()).num_slots) };
        if num_data * LOAD_DEN < num_slots * LOAD_NUM {
            return;
        }
        let new_slots = next_prime(num_slots * 3 / 2 + 1);
        if let Err(e) = self.rehash(new_slots) {
            // Chains just get longer.
            tracing::debug!("Cannot grow hash set to {new_slots} slots: {e}");
        }
    }

    /// Makes room for `additional` entries without further slot growth.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.len() as u64 + additional as u64;
        if needed * LOAD_DEN < self.num_slots() as u64 * LOAD_NUM {
            return Ok(());
        }
        self.rehash(next_prime(needed * LOAD_DEN / LOAD_NUM + 1))
    }

    fn rehash(&mut self, new_slots: u64) -> Result<()> {
        let slots = Self::alloc_slots(&self.alloc, new_slots)?;
        // SAFETY: relinking live nodes into the new, zeroed slot array.
        unsafe {
            let h = self.hdr();
            let table = self.alloc.resolve(slots).as_ptr() as *mut u64;
            for i in 0..(*h).num_slots {
                let mut node = *self.slot(i);
                while node != 0 {
                    let n = self.node(node);
                    let next = (*n).next;
                    let target = table.add(((*n).hash % new_slots) as usize);
                    (*n).next = *target;
                    *target = node;
                    node = next;
                }
            }
            if let Some(old) = RelPtr::new((*h).slots) {
                self.alloc.free(old);
            }
            (*h).slots = slots.get();
            (*h).num_slots = new_slots;
        }
        Ok(())
    }

    unsafe fn free_nodes(&mut self) {
        let h = self.hdr();
        for i in 0..(*h).num_slots {
            let slot = self.slot(i);
            let mut node = *slot;
            while node != 0 {
                let next = (*self.node(node)).next;
                if let Some(node) = RelPtr::new(node) {
                    self.alloc.free(node);
                }
                node = next;
            }
            *slot = 0;
        }
        (*h).num_data = 0;
    }

    /// Frees every entry and shrinks the slot array back to its initial size.
    pub fn clear(&mut self) {
        // SAFETY: every node is reachable exactly once from the slots.
        unsafe {
            self.free_nodes();
            let h = self.hdr();
            if (*h).num_slots != (*h).init_slots {
                // Keeps the bigger, now empty, array if the small one cannot
                // be allocated.
                if let Err(e) = self.rehash((*h).init_slots) {
                    tracing::debug!("Cannot shrink hash set slots: {e}");
                }
            }
        }
    }

    /// Frees every entry and the set itself.
    pub fn destroy(mut self) {
        unsafe {
            self.free_nodes();
            let h = self.hdr();
            if let Some(slots) = RelPtr::new((*h).slots) {
                self.alloc.free(slots);
            }
            self.alloc.free(self.header);
        }
    }
}

#[inline]
fn entry_of(node: u64) -> Result<RelPtr> {
    RelPtr::new(node + NODE_SIZE as u64).ok_or(ShmemError::Corrupted)
}

pub struct Iter<'a, A: ShmAlloc, O: SetOps> {
    set: &'a HashSet<A, O>,
    slot: u64,
    node: u64,
}

impl<'a, A: ShmAlloc, O: SetOps> Iterator for Iter<'a, A, O> {
    type Item = (RelPtr, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: walking live chains of a set borrowed for 'a.
        unsafe {
            let num_slots = (*self.set.hdr()).num_slots;
            while self.node == 0 {
                if self.slot >= num_slots {
                    return None;
                }
                self.node = *self.set.slot(self.slot);
                self.slot += 1;
            }
            let node = self.node;
            self.node = (*self.set.node(node)).next;
            let entry = RelPtr::new(node + NODE_SIZE as u64)?;
            Some((entry, self.set.data(node)))
        }
    }
}
