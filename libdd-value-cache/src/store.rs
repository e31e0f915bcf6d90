// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The persistent history the cache reads through to.

use crate::error::{Result, ValueCacheError};
use crate::record::{HistoryRecord, Timestamp, ValueType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Access to persisted item history.
pub trait HistoryStore {
    /// Values of `item_id` with `start < sec <= end`, the newest seconds
    /// first. A non-zero `count` keeps only the newest `count` values.
    ///
    /// Resolution is whole seconds: the store cannot tell apart values that
    /// share a second, so a count-limited read may cut one in the middle.
    fn get_values(
        &self,
        item_id: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> anyhow::Result<Vec<HistoryRecord>>;
}

impl<S: HistoryStore + ?Sized> HistoryStore for &S {
    fn get_values(
        &self,
        item_id: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> anyhow::Result<Vec<HistoryRecord>> {
        (**self).get_values(item_id, value_type, start, count, end)
    }
}

/// History kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<u64, (ValueType, Vec<HistoryRecord>)>>,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value. Values of an item must all have the same type.
    pub fn add(&self, item_id: u64, record: HistoryRecord) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let (_, values) = items
            .entry(item_id)
            .or_insert_with(|| (record.value.value_type(), Vec::new()));
        let at = values.partition_point(|v| v.timestamp <= record.timestamp);
        values.insert(at, record);
    }

    /// How many reads were served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl HistoryStore for MemoryStore {
    fn get_values(
        &self,
        item_id: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> anyhow::Result<Vec<HistoryRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let Some((vt, values)) = items.get(&item_id) else {
            return Ok(Vec::new());
        };
        anyhow::ensure!(
            *vt == value_type,
            "item {item_id} holds {vt:?} values, not {value_type:?}"
        );
        let limit = if count == 0 { usize::MAX } else { count };
        Ok(values
            .iter()
            .rev()
            .filter(|v| v.timestamp.sec > start && v.timestamp.sec <= end)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// All values with `start <= sec <= end`.
/// First second of the `seconds` long window ending at `end`. Windows
/// reaching before the epoch start at 0, which means the whole history.
pub(crate) fn window_start(end: i64, seconds: i64) -> i64 {
    end.saturating_sub(seconds).max(0)
}

pub(crate) fn read_by_time<S: HistoryStore>(
    store: &S,
    item_id: u64,
    value_type: ValueType,
    start: i64,
    end: i64,
) -> Result<Vec<HistoryRecord>> {
    let start = if start != 0 { start - 1 } else { 0 };
    store
        .get_values(item_id, value_type, start, 0, end)
        .map_err(ValueCacheError::Store)
}

/// Reads at least `count` values at or before `ts` from `[start, end]`,
/// always in whole seconds. Returns the values and whether the range was
/// exhausted, in which case every value of the range was read.
pub(crate) fn read_by_count<S: HistoryStore>(
    store: &S,
    item_id: u64,
    value_type: ValueType,
    start: i64,
    count: usize,
    end: i64,
    ts: Timestamp,
) -> Result<(Vec<HistoryRecord>, bool)> {
    let lower = if start != 0 { start - 1 } else { 0 };
    let read = |from: i64, count: usize, to: i64| {
        store
            .get_values(item_id, value_type, from, count, to)
            .map_err(ValueCacheError::Store)
    };
    // One more than needed: if the extra value lies in an older second than
    // the rest, the rest covers its seconds completely.
    let mut want = count + 1;
    loop {
        let mut values = read(lower, want, end)?;
        if values.len() < want {
            return Ok((values, true));
        }
        let oldest = values
            .iter()
            .map(|v| v.timestamp.sec)
            .min()
            .unwrap_or(lower);
        values.retain(|v| v.timestamp.sec != oldest);
        let mut matching = values.iter().filter(|v| v.timestamp <= ts).count();
        if matching >= count {
            return Ok((values, false));
        }

        // The oldest second was cut, read all of it.
        let second = read(oldest - 1, 0, oldest)?;
        matching += second.iter().filter(|v| v.timestamp <= ts).count();
        values.extend(second);
        if matching >= count {
            return Ok((values, false));
        }
        want = values.len() + (count - matching) + 1;
    }
}

/// Serves a request from the store alone, newest first.
pub(crate) fn read_range<S: HistoryStore>(
    store: &S,
    item_id: u64,
    value_type: ValueType,
    seconds: i64,
    count: usize,
    end: Timestamp,
) -> Result<Vec<HistoryRecord>> {
    let mut values = if count == 0 {
        // Starts one second early to cover nanosecond shifts.
        read_by_time(store, item_id, value_type, window_start(end.sec, seconds), end.sec)?
    } else {
        let start = if seconds == 0 { 0 } else { window_start(end.sec, seconds) };
        read_by_count(store, item_id, value_type, start, count, end.sec, end)?.0
    };

    values.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    values.retain(|v| v.timestamp <= end);
    if count != 0 {
        values.truncate(count);
    }
    if seconds != 0 {
        let start = Timestamp::new(end.sec.saturating_sub(seconds), end.ns);
        values.retain(|v| v.timestamp > start);
    }
    Ok(values)
}
