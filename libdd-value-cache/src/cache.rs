// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The cache proper.
//!
//! Everything lives in one [`Arena`]. Its root is a header pointing at the
//! item set and at the table of interned string values:
//!
//! ```text
//! root -> CacheHeader { items, strings, hits, misses, mode, .. }
//!           items:   HashSet<IdOps> of ItemEntry, keyed by item id
//!           strings: InternTable shared by all string, text and log values
//! ItemEntry { .., records } -> [Slot; cap], `len` in use, oldest first
//! ```
//!
//! An item caches every value with `sec >= cached_from` (or its whole
//! history once `cached_all` is set). Reads reaching further back fetch the
//! missing range from the [`HistoryStore`] with the lock released and merge
//! it only if the item did not change in the meantime.

use crate::config::{ValueCacheConfig, ENV_SIZE};
use crate::error::{Result, ValueCacheError};
use crate::record::{HistoryRecord, HistoryValue, LogValue, Timestamp, ValueType};
use crate::store::{self, HistoryStore};
use libdd_shmem::arena::HEADER_SIZE;
use libdd_shmem::{
    Arena, ArenaGuard, HashSet, IdOps, InternTable, RawStr, RelPtr, ShmAlloc, ShmKey, ShmemError,
    VALUE_CACHE_PROJ_ID,
};
use serde::Serialize;
use std::{mem, ptr};
use tracing::{debug, warn, Level};

const SEC_PER_MIN: i64 = 60;
const SEC_PER_DAY: i64 = 24 * 60 * SEC_PER_MIN;

const ITEMS_INIT_SIZE: usize = 1000;
const STRINGS_INIT_SIZE: usize = 1000;

const LOW_MEMORY_WARNING_PERIOD: i64 = 5 * SEC_PER_MIN;
const LOW_MEMORY_RESET_PERIOD: i64 = SEC_PER_DAY;
const LOW_MEMORY_ITEM_PRINT_LIMIT: usize = 25;
const ITEM_EXPIRE_PERIOD: i64 = SEC_PER_DAY;
const MIN_RANGE: i64 = SEC_PER_MIN;
const MAX_FREE_REQUEST: usize = 128 * 1024;
const MIN_SLOTS: u64 = 4;
const FETCH_ATTEMPTS: usize = 3;

// Upper read bound for items with nothing cached.
const END_OF_TIME: i64 = i64::MAX;

const MODE_NORMAL: u32 = 0;
const MODE_LOWMEM: u32 = 1;

const STATUS_CACHED_ALL: u8 = 1;

#[repr(C)]
struct CacheHeader {
    items: u64,
    strings: u64,
    hits: u64,
    misses: u64,
    mode: u32,
    _pad: u32,
    mode_time: i64,
    last_warning_time: i64,
    min_free_request: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct ItemEntry {
    item_id: u64,
    value_type: u8,
    status: u8,
    _pad: [u8; 6],
    cached_from: i64,
    last_accessed: i64,
    active_range: i64,
    daily_range: i64,
    range_sync_day: i64,
    hits: u64,
    records: u64,
    len: u64,
    cap: u64,
}

impl ItemEntry {
    fn update_cached_from(&mut self, sec: i64) {
        if self.cached_from == 0 || sec < self.cached_from {
            self.cached_from = sec;
        }
    }

    /// Tracks the widest range requested today. Values outside of the
    /// active range are dropped as new ones arrive.
    fn update_range(&mut self, range: i64, now: i64) {
        let range = range.max(MIN_RANGE);
        self.daily_range = self.daily_range.max(range);
        let day = now / SEC_PER_DAY;
        if self.active_range < self.daily_range || day != self.range_sync_day {
            self.active_range = self.daily_range;
            self.daily_range = range;
            self.range_sync_day = day;
        }
    }
}

/// A cached value. Strings are [`RawStr`] bits in `value` and `source`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    sec: i64,
    ns: u32,
    log_timestamp: i32,
    value: u64,
    source: u64,
    log_severity: i32,
    log_eventid: i32,
}

const SLOT_SIZE: usize = mem::size_of::<Slot>();

impl Slot {
    fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.sec, self.ns)
    }
}

fn item_ops() -> IdOps {
    IdOps {
        entry_size: mem::size_of::<ItemEntry>(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_size: usize,
    pub free_size: usize,
    /// Allocations failed and the cache now only evicts: new items are not
    /// admitted until the mode resets.
    pub low_memory: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ItemStats {
    pub item_id: u64,
    pub value_type: ValueType,
    pub values: usize,
    pub hits: u64,
    pub active_range: i64,
    pub last_accessed: i64,
    pub cached_all: bool,
}

#[derive(Clone, Copy, Debug)]
struct Request {
    item_id: u64,
    value_type: ValueType,
    seconds: i64,
    count: usize,
    end: Timestamp,
}

impl Request {
    fn range_start(&self) -> i64 {
        if self.count != 0 && self.seconds == 0 {
            0
        } else {
            store::window_start(self.end.sec, self.seconds)
        }
    }
}

/// What a fetch was based on. A merge is only valid against the same state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Snapshot {
    value_type: u8,
    status: u8,
    cached_from: i64,
    oldest: Option<Timestamp>,
}

#[derive(Debug)]
struct Fetch {
    snapshot: Option<Snapshot>,
    start: i64,
    end: i64,
    cached: usize,
}

struct Fetched {
    values: Vec<HistoryRecord>,
    exhausted: bool,
}

impl Fetch {
    fn run<S: HistoryStore>(&self, store: &S, request: &Request) -> Result<Fetched> {
        let (item_id, value_type) = (request.item_id, request.value_type);
        if request.count == 0 {
            return Ok(Fetched {
                values: store::read_by_time(store, item_id, value_type, self.start, self.end)?,
                exhausted: true,
            });
        }

        // Values between the request end and the cached ones come first, so
        // the cache stays contiguous.
        let mut values = Vec::new();
        let mut end = self.end;
        if end > request.end.sec {
            let newer = request.end.sec.saturating_add(1);
            values = store::read_by_time(store, item_id, value_type, newer, end)?;
            end = request.end.sec;
        }
        let (older, exhausted) = store::read_by_count(
            store,
            item_id,
            value_type,
            self.start,
            request.count - self.cached,
            end,
            request.end,
        )?;
        values.extend(older);
        Ok(Fetched { values, exhausted })
    }
}

enum Step {
    Done(Vec<HistoryRecord>),
    Fetch(Fetch),
    Retry,
    Bypass,
}

enum Head {
    Added { grown: bool },
    Dropped,
    Emptied,
}

/// Read-through cache of recent item history.
///
/// With a zero size the cache is disabled and every read goes straight to
/// the store.
pub struct ValueCache<S> {
    arena: Option<Arena>,
    store: S,
    clock: fn() -> i64,
}

impl<S: HistoryStore> ValueCache<S> {
    /// Creates a cache, in a new shared segment if the configuration has a
    /// key path.
    pub fn create(config: &ValueCacheConfig, store: S) -> Result<Self> {
        if config.size == 0 {
            debug!("Value cache is disabled");
            return Ok(Self::disabled(config, store));
        }
        let key = config
            .key_path
            .as_ref()
            .map(|path| ShmKey::derive(path, VALUE_CACHE_PROJ_ID));
        let arena = Arena::create(key.as_ref(), config.size, "value cache", Some(ENV_SIZE))?
            .with_lock_timeout(config.lock_timeout);
        Self::init(&arena.lock()?, config.size)?;
        Ok(ValueCache {
            arena: Some(arena),
            store,
            clock: config.clock,
        })
    }

    /// Attaches to the cache another process created with the same
    /// configuration.
    pub fn attach(config: &ValueCacheConfig, store: S) -> Result<Self> {
        if config.size == 0 {
            return Ok(Self::disabled(config, store));
        }
        let path = config.key_path.as_ref().ok_or(ValueCacheError::NotShared)?;
        let arena = Arena::attach(&ShmKey::derive(path, VALUE_CACHE_PROJ_ID), "value cache")?
            .with_param(ENV_SIZE)
            .with_lock_timeout(config.lock_timeout);
        arena.lock()?.root().ok_or(ShmemError::Corrupted)?;
        Ok(ValueCache {
            arena: Some(arena),
            store,
            clock: config.clock,
        })
    }

    fn disabled(config: &ValueCacheConfig, store: S) -> Self {
        ValueCache {
            arena: None,
            store,
            clock: config.clock,
        }
    }

    fn init(heap: &ArenaGuard<'_>, size: usize) -> Result<()> {
        let root = heap.malloc(mem::size_of::<CacheHeader>())?;
        let items = HashSet::create(heap, ITEMS_INIT_SIZE, item_ops())?;
        let strings = InternTable::create(heap, STRINGS_INIT_SIZE)?;
        // A release request is 5% of the cache, capped.
        let min_free_request = (size.saturating_sub(HEADER_SIZE) / 100 * 5).min(MAX_FREE_REQUEST);
        // SAFETY: root is a fresh allocation sized for the header.
        unsafe {
            ptr::write(
                heap.resolve(root).as_ptr() as *mut CacheHeader,
                CacheHeader {
                    items: items.header().get(),
                    strings: strings.header().get(),
                    hits: 0,
                    misses: 0,
                    mode: MODE_NORMAL,
                    _pad: 0,
                    mode_time: 0,
                    last_warning_time: 0,
                    min_free_request: min_free_request as u64,
                },
            )
        };
        heap.set_root(Some(root));
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.arena.is_some()
    }

    pub fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Locked<'_>) -> Result<R>) -> Result<R> {
        let arena = self.arena.as_ref().ok_or(ValueCacheError::Disabled)?;
        let guard = arena.lock()?;
        let mut cache = Locked::new(&guard, (self.clock)())?;
        f(&mut cache)
    }

    /// Feeds a newly collected value. Only items the cache already tracks
    /// with a known history state take it.
    pub fn add_value(
        &self,
        item_id: u64,
        value_type: ValueType,
        timestamp: Timestamp,
        value: HistoryValue,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let record = HistoryRecord::new(timestamp, value);
        self.locked(|cache| {
            cache.add_value(item_id, value_type, &record);
            Ok(())
        })
    }

    /// Starts tracking newly created items whose whole history is known to
    /// be empty, so their first values are cached without a store read.
    pub fn add_new_items(&self, items: &[(u64, ValueType)]) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.locked(|cache| {
            cache.add_new_items(items);
            Ok(())
        })
    }

    /// Values of an item at or before `end`, newest first.
    ///
    /// With `count == 0` returns the values of the last `seconds` seconds.
    /// Otherwise returns up to `count` values, from the last `seconds`
    /// seconds unless `seconds` is 0. The caller owns the records.
    pub fn get_value_range(
        &self,
        item_id: u64,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        end: Timestamp,
    ) -> Result<Vec<HistoryRecord>> {
        debug!("Reading item {item_id} {value_type:?} values: count {count} period {seconds} end {end}");
        if !self.is_enabled() {
            return store::read_range(&self.store, item_id, value_type, seconds, count, end);
        }
        let request = Request {
            item_id,
            value_type,
            seconds,
            count,
            end,
        };
        if let Some(values) = self.read_through(&request)? {
            return Ok(values);
        }

        let values = store::read_range(&self.store, item_id, value_type, seconds, count, end);
        self.locked(|cache| {
            cache.remove_item_by_id(item_id);
            if let Ok(values) = &values {
                cache.hdr.misses += values.len() as u64;
            }
            Ok(())
        })?;
        values
    }

    /// The last value at or before `ts`.
    pub fn get_value(
        &self,
        item_id: u64,
        value_type: ValueType,
        ts: Timestamp,
    ) -> Result<Option<HistoryRecord>> {
        Ok(self
            .get_value_range(item_id, value_type, ts.sec, 1, ts)?
            .into_iter()
            .next())
    }

    /// Serves a request from the cache, filling it from the store as needed.
    /// None means the request must bypass the cache.
    fn read_through(&self, request: &Request) -> Result<Option<Vec<HistoryRecord>>> {
        for _ in 0..FETCH_ATTEMPTS {
            let fetch = match self.locked(|cache| Ok(cache.begin(request)))? {
                Step::Done(values) => return Ok(Some(values)),
                Step::Fetch(fetch) => fetch,
                Step::Retry | Step::Bypass => return Ok(None),
            };
            let fetched = match fetch.run(&self.store, request) {
                Ok(fetched) => fetched,
                Err(e) => {
                    debug!("Cannot read item {} history: {e}", request.item_id);
                    return Ok(None);
                }
            };
            match self.locked(|cache| Ok(cache.finish(request, &fetch, fetched)))? {
                Step::Done(values) => return Ok(Some(values)),
                Step::Bypass => return Ok(None),
                Step::Fetch(_) | Step::Retry => {
                    debug!("Item {} changed during a history read", request.item_id)
                }
            }
        }
        Ok(None)
    }

    pub fn get_statistics(&self) -> Result<CacheStats> {
        self.locked(|cache| Ok(cache.statistics()))
    }

    pub fn item_stats(&self) -> Result<Vec<ItemStats>> {
        self.locked(|cache| Ok(cache.item_stats()))
    }

    pub fn remove_items(&self, item_ids: &[u64]) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.locked(|cache| {
            for &item_id in item_ids {
                cache.remove_item_by_id(item_id);
            }
            Ok(())
        })
    }

    /// Drops every item and resets the statistics and the mode.
    pub fn reset(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.locked(|cache| {
            cache.reset();
            Ok(())
        })
    }
}

/// The cache while its arena is locked.
struct Locked<'g> {
    heap: &'g ArenaGuard<'g>,
    hdr: &'g mut CacheHeader,
    items: HashSet<&'g ArenaGuard<'g>, IdOps>,
    strings: InternTable<&'g ArenaGuard<'g>>,
    now: i64,
}

impl<'g> Locked<'g> {
    fn new(heap: &'g ArenaGuard<'g>, now: i64) -> Result<Self> {
        let root = heap.root().ok_or(ShmemError::Corrupted)?;
        // SAFETY: the root is the header written by `ValueCache::init`, and
        // the lock is held for 'g.
        let hdr = unsafe { &mut *(heap.resolve(root).as_ptr() as *mut CacheHeader) };
        let items_header = RelPtr::new(hdr.items).ok_or(ShmemError::Corrupted)?;
        let strings_header = RelPtr::new(hdr.strings).ok_or(ShmemError::Corrupted)?;
        // SAFETY: both were created in this arena by `ValueCache::init`.
        let (items, strings) = unsafe {
            (
                HashSet::attach(heap, items_header, item_ops()),
                InternTable::attach(heap, strings_header),
            )
        };
        Ok(Locked {
            heap,
            hdr,
            items,
            strings,
            now,
        })
    }

    fn load(&self, entry: RelPtr) -> ItemEntry {
        // SAFETY: item set entries are ItemEntry sized and 8-byte aligned.
        unsafe { ptr::read(self.heap.resolve(entry).as_ptr() as *const ItemEntry) }
    }

    fn save(&mut self, entry: RelPtr, item: &ItemEntry) {
        // SAFETY: as in `load`, and the lock makes this the only writer.
        unsafe { ptr::write(self.heap.resolve(entry).as_ptr() as *mut ItemEntry, *item) }
    }

    fn slots(&self, item: &ItemEntry) -> &[Slot] {
        match RelPtr::new(item.records) {
            // SAFETY: `records` holds `cap >= len` slots, the first `len` in use.
            Some(records) => unsafe {
                std::slice::from_raw_parts(
                    self.heap.resolve(records).as_ptr() as *const Slot,
                    item.len as usize,
                )
            },
            None => &[],
        }
    }

    fn snapshot(&self, item: &ItemEntry) -> Snapshot {
        Snapshot {
            value_type: item.value_type,
            status: item.status,
            cached_from: item.cached_from,
            oldest: self.slots(item).first().map(Slot::timestamp),
        }
    }

    /// Runs an allocation. If the arena is full, releases space once on
    /// behalf of `source` and retries.
    fn with_release<T>(
        &mut self,
        source: RelPtr,
        size: usize,
        mut op: impl FnMut(&mut Self) -> libdd_shmem::Result<T>,
    ) -> Result<T> {
        match op(self) {
            Err(e) if e.is_out_of_space() => {
                self.release_space(source, size);
                Ok(op(self)?)
            }
            result => Ok(result?),
        }
    }

    fn intern(&mut self, source: RelPtr, s: &str) -> Result<RawStr> {
        self.with_release(source, s.len() + 64, |cache| cache.strings.intern(s))
    }

    fn string(&self, bits: u64) -> String {
        match RawStr::from_bits(bits) {
            // SAFETY: slots hold a reference to their strings.
            Some(raw) => unsafe { self.strings.get(raw) }.to_owned(),
            None => String::new(),
        }
    }

    fn store_value(&mut self, source: RelPtr, record: &HistoryRecord) -> Result<Slot> {
        let mut slot = Slot {
            sec: record.timestamp.sec,
            ns: record.timestamp.ns,
            ..Default::default()
        };
        match &record.value {
            HistoryValue::Float(v) => slot.value = v.to_bits(),
            HistoryValue::Uint(v) => slot.value = *v,
            HistoryValue::Str(s) | HistoryValue::Text(s) => {
                slot.value = self.intern(source, s)?.to_bits()
            }
            HistoryValue::Log(log) => {
                let value = self.intern(source, &log.value)?;
                if let Some(src) = &log.source {
                    match self.intern(source, src) {
                        Ok(raw) => slot.source = raw.to_bits(),
                        Err(e) => {
                            // SAFETY: interned just above.
                            unsafe { self.strings.release(value) };
                            return Err(e);
                        }
                    }
                }
                slot.value = value.to_bits();
                slot.log_timestamp = log.timestamp;
                slot.log_severity = log.severity;
                slot.log_eventid = log.logeventid;
            }
        }
        Ok(slot)
    }

    fn load_value(&self, value_type: ValueType, slot: &Slot) -> HistoryRecord {
        let value = match value_type {
            ValueType::Float => HistoryValue::Float(f64::from_bits(slot.value)),
            ValueType::Uint => HistoryValue::Uint(slot.value),
            ValueType::Str => HistoryValue::Str(self.string(slot.value)),
            ValueType::Text => HistoryValue::Text(self.string(slot.value)),
            ValueType::Log => HistoryValue::Log(LogValue {
                timestamp: slot.log_timestamp,
                severity: slot.log_severity,
                logeventid: slot.log_eventid,
                source: (slot.source != 0).then(|| self.string(slot.source)),
                value: self.string(slot.value),
            }),
        };
        HistoryRecord::new(slot.timestamp(), value)
    }

    fn release_slot(&mut self, value_type: u8, slot: &Slot) {
        let strings = match ValueType::try_from(value_type) {
            Ok(ValueType::Str | ValueType::Text) => [slot.value, 0],
            Ok(ValueType::Log) => [slot.value, slot.source],
            _ => return,
        };
        for raw in strings.into_iter().filter_map(RawStr::from_bits) {
            // SAFETY: every slot holds one reference to each of its strings.
            unsafe { self.strings.release(raw) };
        }
    }

    fn release_slots(&mut self, value_type: u8, slots: &[Slot]) {
        for slot in slots {
            self.release_slot(value_type, slot);
        }
    }

    /// Makes room for `additional` more slots. Returns whether the array
    /// was reallocated.
    fn reserve(&mut self, source: RelPtr, item: &mut ItemEntry, additional: usize) -> Result<bool> {
        let needed = item.len + additional as u64;
        if needed <= item.cap {
            return Ok(false);
        }
        let cap = needed.max(item.cap * 2).max(MIN_SLOTS);
        let bytes = (cap as usize)
            .checked_mul(SLOT_SIZE)
            .ok_or(ShmemError::InvalidSize(cap as usize))?;
        let records = RelPtr::new(item.records);
        let grown = self.with_release(source, bytes, |cache| match records {
            // SAFETY: the live slot array of this item.
            Some(records) => unsafe { cache.heap.realloc(records, bytes) },
            None => cache.heap.malloc(bytes),
        })?;
        item.records = grown.get();
        item.cap = cap;
        Ok(true)
    }

    /// Inserts at slot `at`. Room must have been reserved.
    fn insert_slots(&mut self, item: &mut ItemEntry, at: usize, new: &[Slot]) {
        let Some(records) = RelPtr::new(item.records) else {
            return;
        };
        let len = item.len as usize;
        debug_assert!(len + new.len() <= item.cap as usize && at <= len);
        let base = self.heap.resolve(records).as_ptr() as *mut Slot;
        // SAFETY: both ranges are inside the reserved array.
        unsafe {
            ptr::copy(base.add(at), base.add(at + new.len()), len - at);
            ptr::copy_nonoverlapping(new.as_ptr(), base.add(at), new.len());
        }
        item.len += new.len() as u64;
    }

    /// Drops the `n` oldest slots.
    fn drain_front(&mut self, item: &mut ItemEntry, n: usize) {
        if n == 0 {
            return;
        }
        let Some(records) = RelPtr::new(item.records) else {
            return;
        };
        for i in 0..n {
            let slot = self.slots(item)[i];
            self.release_slot(item.value_type, &slot);
        }
        let base = self.heap.resolve(records).as_ptr() as *mut Slot;
        // SAFETY: the first `len` slots are in use.
        unsafe { ptr::copy(base.add(n), base, item.len as usize - n) };
        item.len -= n as u64;
    }

    fn remove_values_before(&mut self, item: &mut ItemEntry, sec: i64) {
        if item.status == STATUS_CACHED_ALL {
            item.status = 0;
        }
        let n = self.slots(item).partition_point(|s| s.sec < sec);
        self.drain_front(item, n);
    }

    /// Drops values older than the active range before `last_sec`, but
    /// never the newest second. Seconds are dropped whole.
    fn clean(&mut self, item: &mut ItemEntry, last_sec: i64) {
        if item.active_range == 0 {
            return;
        }
        let Some(newest) = self.slots(item).last().map(|s| s.sec) else {
            return;
        };
        let limit = last_sec.saturating_sub(item.active_range).min(newest);
        let n = self.slots(item).partition_point(|s| s.sec < limit);
        if n == 0 {
            return;
        }
        item.cached_from = self.slots(item)[n - 1].sec + 1;
        item.status = 0;
        self.drain_front(item, n);
    }

    fn add_at_head(
        &mut self,
        entry: RelPtr,
        item: &mut ItemEntry,
        record: &HistoryRecord,
    ) -> Result<Head> {
        let ts = record.timestamp;
        if self.slots(item).first().is_some_and(|s| s.timestamp() > ts) {
            // Older than everything cached: the cached range cannot hold it,
            // so drop its second from the cache instead.
            self.remove_values_before(item, ts.sec + 1);
            if item.len == 0 {
                return Ok(Head::Emptied);
            }
            if item.cached_from <= ts.sec {
                item.cached_from = ts.sec + 1;
            }
            return Ok(Head::Dropped);
        }

        let slot = self.store_value(entry, record)?;
        let grown = match self.reserve(entry, item, 1) {
            Ok(grown) => grown,
            Err(e) => {
                self.release_slot(item.value_type, &slot);
                return Err(e);
            }
        };
        let at = self.slots(item).partition_point(|s| s.timestamp() <= ts);
        self.insert_slots(item, at, &[slot]);
        Ok(Head::Added { grown })
    }

    /// Prepends values read from the store. Either all of them are cached
    /// or none.
    fn add_at_tail(
        &mut self,
        entry: RelPtr,
        item: &mut ItemEntry,
        mut values: Vec<HistoryRecord>,
    ) -> Result<()> {
        let value_type = item.value_type;
        if let Some(oldest) = self.slots(item).first().map(Slot::timestamp) {
            values.retain(|v| v.timestamp < oldest);
        }
        values.retain(|v| v.value.value_type() as u8 == value_type);
        if values.is_empty() {
            return Ok(());
        }
        values.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut slots = Vec::with_capacity(values.len());
        for value in &values {
            match self.store_value(entry, value) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    self.release_slots(value_type, &slots);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.reserve(entry, item, slots.len()) {
            self.release_slots(value_type, &slots);
            return Err(e);
        }
        self.insert_slots(item, 0, &slots);
        Ok(())
    }

    fn insert_item(&mut self, item_id: u64, value_type: ValueType) -> libdd_shmem::Result<RelPtr> {
        let (entry, created) = self.items.insert(&item_id)?;
        if created {
            self.save(
                entry,
                &ItemEntry {
                    item_id,
                    value_type: value_type as u8,
                    ..Default::default()
                },
            );
        }
        Ok(entry)
    }

    fn remove_item(&mut self, entry: RelPtr) {
        let item = self.load(entry);
        for i in 0..item.len as usize {
            let slot = self.slots(&item)[i];
            self.release_slot(item.value_type, &slot);
        }
        if let Some(records) = RelPtr::new(item.records) {
            // SAFETY: the item's own slot array, unreachable from now on.
            unsafe { self.heap.free(records) };
        }
        // SAFETY: entry came from this set.
        unsafe { self.items.remove_ptr(entry) };
    }

    fn remove_item_by_id(&mut self, item_id: u64) {
        if let Some(entry) = self.items.search_ptr(&item_id) {
            self.remove_item(entry);
        }
    }

    fn add_value(&mut self, item_id: u64, value_type: ValueType, record: &HistoryRecord) {
        let Some(entry) = self.items.search_ptr(&item_id) else {
            return;
        };
        let mut item = self.load(entry);
        // Until the item's history state is known, new values could leave
        // a hole in front of them.
        if item.status != STATUS_CACHED_ALL && item.cached_from == 0 {
            return;
        }
        if item.value_type != value_type as u8 || record.value.value_type() != value_type {
            debug!("Item {item_id} changed its value type to {value_type:?}, dropping it from the cache");
            self.remove_item(entry);
            return;
        }

        let last_sec = self.slots(&item).last().map_or(self.now, |s| s.sec);
        match self.add_at_head(entry, &mut item, record) {
            Ok(Head::Added { grown }) => {
                if grown {
                    self.clean(&mut item, last_sec);
                }
                self.save(entry, &item);
            }
            Ok(Head::Dropped) => self.save(entry, &item),
            Ok(Head::Emptied) => {
                self.save(entry, &item);
                self.remove_item(entry);
            }
            Err(e) => {
                debug!("Cannot cache item {item_id} value: {e}");
                self.save(entry, &item);
                self.remove_item(entry);
            }
        }
    }

    fn add_new_items(&mut self, items: &[(u64, ValueType)]) {
        if self.hdr.mode != MODE_NORMAL {
            return;
        }
        for &(item_id, value_type) in items {
            if self.items.search_ptr(&item_id).is_some() {
                continue;
            }
            match self.items.insert(&item_id) {
                Ok((entry, _)) => {
                    let item = ItemEntry {
                        item_id,
                        value_type: value_type as u8,
                        status: STATUS_CACHED_ALL,
                        last_accessed: self.now,
                        ..Default::default()
                    };
                    self.save(entry, &item);
                }
                Err(e) => {
                    // Low memory mode starts with the next caching request.
                    debug!("Cannot add new item {item_id} to the value cache: {e}");
                    break;
                }
            }
        }
    }

    fn begin(&mut self, request: &Request) -> Step {
        if self.hdr.mode == MODE_LOWMEM {
            self.warn_low_memory();
        }
        let entry = self.items.search_ptr(&request.item_id);
        let item = match entry {
            Some(entry) => {
                let item = self.load(entry);
                if item.value_type != request.value_type as u8 {
                    return Step::Bypass;
                }
                item
            }
            None if self.hdr.mode != MODE_NORMAL => return Step::Bypass,
            None => ItemEntry::default(),
        };

        match (self.plan(&item, request), entry) {
            (Some(mut fetch), entry) => {
                fetch.snapshot = entry.map(|_| self.snapshot(&item));
                Step::Fetch(fetch)
            }
            (None, Some(entry)) => Step::Done(self.collect(entry, request, 0)),
            (None, None) => Step::Done(Vec::new()),
        }
    }

    /// The store read needed before the cache can serve `request`, if any.
    fn plan(&self, item: &ItemEntry, request: &Request) -> Option<Fetch> {
        if item.status == STATUS_CACHED_ALL {
            return None;
        }
        let start = request.range_start();
        if item.cached_from != 0 && start >= item.cached_from {
            return None;
        }
        let slots = self.slots(item);
        // Values before the oldest cached one, not including it.
        let end = slots.first().map_or(END_OF_TIME, |s| s.sec - 1);
        let mut cached = 0;
        if request.count == 0 {
            if start >= end {
                return None;
            }
        } else {
            cached = slots.partition_point(|s| s.timestamp() <= request.end);
            if cached >= request.count {
                return None;
            }
        }
        Some(Fetch {
            snapshot: None,
            start,
            end,
            cached,
        })
    }

    fn finish(&mut self, request: &Request, fetch: &Fetch, fetched: Fetched) -> Step {
        let entry = self.items.search_ptr(&request.item_id);
        if entry.map(|entry| self.snapshot(&self.load(entry))) != fetch.snapshot {
            return Step::Retry;
        }
        let entry = match entry {
            Some(entry) => entry,
            None => match self.insert_item(request.item_id, request.value_type) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Cannot add item {} to the value cache: {e}", request.item_id);
                    return Step::Bypass;
                }
            },
        };

        let Fetched { values, exhausted } = fetched;
        let read = values.len();
        let mut item = self.load(entry);
        if let Err(e) = self.add_at_tail(entry, &mut item, values) {
            debug!("Cannot cache item {} history: {e}", request.item_id);
            self.save(entry, &item);
            return Step::Bypass;
        }

        if request.count == 0 {
            // A time based read covers the whole range even if it is empty.
            if fetch.start == 0 {
                item.status = STATUS_CACHED_ALL;
                item.active_range = 0;
                item.daily_range = 0;
            } else {
                item.status = 0;
                item.update_cached_from(fetch.start);
            }
        } else {
            if exhausted && fetch.start == 0 {
                item.status = STATUS_CACHED_ALL;
                item.active_range = 0;
                item.daily_range = 0;
            }
            match self.slots(&item).first().map(|s| s.sec) {
                Some(oldest) if !exhausted || fetch.start == 0 => item.update_cached_from(oldest),
                _ if fetch.start != 0 => item.update_cached_from(fetch.start),
                _ => {}
            }
        }
        self.save(entry, &item);
        Step::Done(self.collect(entry, request, read))
    }

    /// Copies the requested values out and accounts the hits and misses.
    /// `read` values were just fetched from the store.
    fn collect(&mut self, entry: RelPtr, request: &Request, read: usize) -> Vec<HistoryRecord> {
        let mut item = self.load(entry);
        let end = request.end;
        let start = if request.count == 0 || request.seconds != 0 {
            Timestamp::new(end.sec.saturating_sub(request.seconds), end.ns)
        } else {
            Timestamp::default()
        };
        let limit = if request.count == 0 {
            usize::MAX
        } else {
            request.count
        };

        let slots = self.slots(&item);
        let upto = slots.partition_point(|s| s.timestamp() <= end);
        let values: Vec<HistoryRecord> = slots[..upto]
            .iter()
            .rev()
            .take_while(|s| s.timestamp() > start)
            .take(limit)
            .map(|s| self.load_value(request.value_type, s))
            .collect();

        let range = if request.count == 0 {
            // One more second for nanosecond shifts.
            Some(
                request
                    .seconds
                    .saturating_add(self.now.saturating_sub(end.sec))
                    .saturating_add(1),
            )
        } else if values.len() < request.count {
            (request.seconds != 0)
                .then(|| self.now.saturating_sub(end.sec.saturating_sub(request.seconds)))
        } else {
            values
                .last()
                .map(|v| self.now.saturating_sub(v.timestamp.sec.saturating_sub(1)))
        };
        if let Some(range) = range {
            item.update_range(range, self.now);
        }

        let misses = read.min(values.len());
        let hits = values.len() - misses;
        item.hits += hits as u64;
        item.last_accessed = self.now;
        self.hdr.hits += hits as u64;
        self.hdr.misses += misses as u64;
        self.save(entry, &item);
        values
    }

    /// Drops items not read for a day, except `source`. Returns the bytes
    /// freed.
    fn release_unused_items(&mut self, source: RelPtr) -> usize {
        let before = self.heap.free_size();
        let cutoff = self.now - ITEM_EXPIRE_PERIOD;
        let expired: Vec<RelPtr> = self
            .items
            .iter()
            .map(|(entry, _)| entry)
            .filter(|&entry| {
                let item = self.load(entry);
                entry != source && item.last_accessed != 0 && item.last_accessed < cutoff
            })
            .collect();
        for entry in expired {
            self.remove_item(entry);
        }
        self.heap.free_size().saturating_sub(before)
    }

    /// Frees at least `space` bytes, and no less than the configured
    /// minimum, for `source`, which is never dropped.
    fn release_space(&mut self, source: RelPtr, space: usize) {
        let space = space.max(self.hdr.min_free_request as usize);
        let mut freed = self.release_unused_items(source);
        if freed >= space {
            return;
        }

        if self.hdr.mode != MODE_LOWMEM {
            warn!("Value cache is out of memory, switching to low memory mode");
        }
        self.hdr.mode = MODE_LOWMEM;
        self.hdr.mode_time = self.now;
        self.warn_low_memory();

        // The least read per cached value go first.
        let mut victims: Vec<(f64, RelPtr)> = self
            .items
            .iter()
            .map(|(entry, _)| entry)
            .filter(|&entry| entry != source)
            .map(|entry| {
                let item = self.load(entry);
                let weight = if item.len > 0 {
                    item.hits as f64 / item.len as f64
                } else {
                    0.0
                };
                (weight, entry)
            })
            .collect();
        victims.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, entry) in victims {
            if freed >= space {
                break;
            }
            let before = self.heap.free_size();
            self.remove_item(entry);
            freed += self.heap.free_size().saturating_sub(before);
        }
        debug!("Released {freed} bytes of value cache space, {space} requested");
    }

    fn warn_low_memory(&mut self) {
        if self.now - self.hdr.mode_time > LOW_MEMORY_RESET_PERIOD {
            self.hdr.mode = MODE_NORMAL;
            self.hdr.mode_time = self.now;
            warn!("Value cache has been switched from low memory to normal operation mode");
        } else if self.now - self.hdr.last_warning_time > LOW_MEMORY_WARNING_PERIOD {
            self.hdr.last_warning_time = self.now;
            self.dump_items_statistics();
            self.heap.dump_stats(Level::WARN);
            warn!("Value cache is fully used: please increase {ENV_SIZE}");
        }
    }

    fn dump_items_statistics(&self) {
        warn!("=== most used items statistics for value cache ===");
        let mut items: Vec<ItemEntry> = self
            .items
            .iter()
            .map(|(entry, _)| self.load(entry))
            .collect();
        let total = items.iter().map(|item| item.len).sum::<u64>().max(1);
        items.sort_by(|a, b| b.len.cmp(&a.len));
        for item in items.iter().take(LOW_MEMORY_ITEM_PRINT_LIMIT) {
            warn!(
                "itemid:{} active range:{} hits:{} count:{} perc:{:.2}%",
                item.item_id,
                item.active_range,
                item.hits,
                item.len,
                100.0 * item.len as f64 / total as f64
            );
        }
        warn!("==================================================");
    }

    fn statistics(&self) -> CacheStats {
        CacheStats {
            hits: self.hdr.hits,
            misses: self.hdr.misses,
            total_size: self.heap.total_size(),
            free_size: self.heap.free_size(),
            low_memory: self.hdr.mode == MODE_LOWMEM,
        }
    }

    fn item_stats(&self) -> Vec<ItemStats> {
        self.items
            .iter()
            .map(|(entry, _)| self.load(entry))
            .filter_map(|item| {
                Some(ItemStats {
                    item_id: item.item_id,
                    value_type: ValueType::try_from(item.value_type).ok()?,
                    values: item.len as usize,
                    hits: item.hits,
                    active_range: item.active_range,
                    last_accessed: item.last_accessed,
                    cached_all: item.status == STATUS_CACHED_ALL,
                })
            })
            .collect()
    }

    fn reset(&mut self) {
        let entries: Vec<RelPtr> = self.items.iter().map(|(entry, _)| entry).collect();
        for entry in entries {
            self.remove_item(entry);
        }
        self.items.clear();
        self.hdr.hits = 0;
        self.hdr.misses = 0;
        self.hdr.mode = MODE_NORMAL;
        self.hdr.mode_time = 0;
        self.hdr.last_warning_time = 0;
    }
}
