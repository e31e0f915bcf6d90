// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_value_cache::{
    HistoryRecord, HistoryStore, HistoryValue, LogValue, MemoryStore, Result, Timestamp,
    ValueCache, ValueCacheConfig, ValueType,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

const DAY: i64 = 24 * 60 * 60;

fn fixed_clock() -> i64 {
    1_000_000
}

fn private(size: usize) -> ValueCacheConfig {
    ValueCacheConfig {
        clock: fixed_clock,
        ..ValueCacheConfig::private(size)
    }
}

fn shared(tag: &str) -> ValueCacheConfig {
    ValueCacheConfig {
        key_path: Some(PathBuf::from(format!(
            "/libdd-value-cache-it/{}/{tag}",
            std::process::id()
        ))),
        ..private(1 << 20)
    }
}

/// Items with one `Uint` value per second in `secs`.
fn uint_store(items: impl IntoIterator<Item = u64>, secs: std::ops::Range<i64>) -> MemoryStore {
    let store = MemoryStore::new();
    for item in items {
        for sec in secs.clone() {
            store.add(
                item,
                HistoryRecord::new(Timestamp::new(sec, 0), HistoryValue::Uint(sec as u64)),
            );
        }
    }
    store
}

fn secs(values: &[HistoryRecord]) -> Vec<i64> {
    values.iter().map(|v| v.timestamp.sec).collect()
}

#[test]
fn reads_through_and_then_hits() -> Result<()> {
    let cache = ValueCache::create(&private(1 << 20), uint_store([1], 1000..1100))?;
    let end = Timestamp::new(1099, 0);

    let values = cache.get_value_range(1, ValueType::Uint, 10, 0, end)?;
    assert_eq!(secs(&values), (1090..1100).rev().collect::<Vec<_>>());
    assert_eq!(cache.store().reads(), 1);
    let stats = cache.get_statistics()?;
    assert_eq!((stats.hits, stats.misses), (0, 10));

    let again = cache.get_value_range(1, ValueType::Uint, 10, 0, end)?;
    assert_eq!(again, values);
    assert_eq!(cache.store().reads(), 1);
    let stats = cache.get_statistics()?;
    assert_eq!((stats.hits, stats.misses), (10, 10));
    assert!(!stats.low_memory);

    // Only the part older than the cached range is read.
    let values = cache.get_value_range(1, ValueType::Uint, 0, 20, end)?;
    assert_eq!(secs(&values), (1080..1100).rev().collect::<Vec<_>>());
    let stats = cache.get_statistics()?;
    assert_eq!((stats.hits, stats.misses), (21, 19));

    let value = cache.get_value(1, ValueType::Uint, Timestamp::new(1050, 5))?;
    assert_eq!(value.map(|v| v.value), Some(HistoryValue::Uint(1050)));
    Ok(())
}

#[test]
fn new_values_extend_cached_items() -> Result<()> {
    let cache = ValueCache::create(&private(1 << 20), uint_store([1], 1000..1010))?;
    cache.get_value_range(1, ValueType::Uint, 5, 0, Timestamp::new(1009, 0))?;
    let reads = cache.store().reads();

    cache.add_value(1, ValueType::Uint, Timestamp::new(1010, 0), HistoryValue::Uint(7))?;
    let value = cache.get_value(1, ValueType::Uint, Timestamp::new(1010, 0))?;
    assert_eq!(value.map(|v| v.value), Some(HistoryValue::Uint(7)));
    assert_eq!(cache.store().reads(), reads);

    // A type change drops the item, the next read goes to the store again.
    cache.add_value(1, ValueType::Float, Timestamp::new(1011, 0), HistoryValue::Float(0.5))?;
    assert!(cache.item_stats()?.is_empty());
    Ok(())
}

#[test]
fn time_read_covering_all_history_caches_everything() -> Result<()> {
    let cache = ValueCache::create(&private(1 << 20), uint_store([1], 100..110))?;
    let end = Timestamp::new(400, 0);

    for _ in 0..3 {
        let values = cache.get_value_range(1, ValueType::Uint, 500, 0, end)?;
        assert_eq!(secs(&values), (100..110).rev().collect::<Vec<_>>());
    }
    assert_eq!(cache.store().reads(), 1);
    let stats = cache.item_stats()?;
    assert!(stats[0].cached_all);
    assert_eq!(stats[0].values, 10);

    cache.add_value(1, ValueType::Uint, Timestamp::new(401, 0), HistoryValue::Uint(9))?;
    assert_eq!(cache.item_stats()?[0].values, 11);
    let last = cache.get_value(1, ValueType::Uint, Timestamp::new(401, 0))?;
    assert_eq!(last.map(|v| v.value), Some(HistoryValue::Uint(9)));
    assert_eq!(cache.store().reads(), 1);
    Ok(())
}

#[test]
fn unbounded_windows_read_all_history() -> Result<()> {
    let cache = ValueCache::create(&private(1 << 20), uint_store([1, 2], 100..110))?;
    let end = Timestamp::new(200, 0);

    let values = cache.get_value_range(1, ValueType::Uint, i64::MAX, 0, end)?;
    assert_eq!(secs(&values), (100..110).rev().collect::<Vec<_>>());
    let values = cache.get_value_range(2, ValueType::Uint, i64::MAX, 5, end)?;
    assert_eq!(secs(&values), (105..110).rev().collect::<Vec<_>>());

    // Served from the cache the second time.
    let reads = cache.store().reads();
    assert_eq!(cache.get_value_range(1, ValueType::Uint, i64::MAX, 0, end)?.len(), 10);
    assert_eq!(cache.get_value_range(2, ValueType::Uint, i64::MAX, 5, end)?.len(), 5);
    assert_eq!(cache.store().reads(), reads);
    assert!(cache.item_stats()?.iter().all(|s| s.active_range > 0));
    Ok(())
}

#[test]
fn mismatched_read_bypasses_and_drops_the_item() -> Result<()> {
    let cache = ValueCache::create(&private(1 << 20), uint_store([4], 100..110))?;
    cache.get_value_range(4, ValueType::Uint, 0, 5, Timestamp::new(200, 0))?;
    assert_eq!(cache.item_stats()?.len(), 1);

    // The store rejects the type as well.
    assert!(cache
        .get_value_range(4, ValueType::Float, 0, 5, Timestamp::new(200, 0))
        .is_err());
    assert!(cache.item_stats()?.is_empty());
    Ok(())
}

#[test]
fn string_values_round_trip() -> Result<()> {
    let store = MemoryStore::new();
    let log = |sec: i64, source: Option<&str>| {
        HistoryRecord::new(
            Timestamp::new(sec, 250),
            HistoryValue::Log(LogValue {
                timestamp: sec as i32 - 3,
                severity: 4,
                logeventid: 4625,
                source: source.map(str::to_owned),
                value: format!("failed logon #{sec}"),
            }),
        )
    };
    for sec in 10..20 {
        store.add(8, log(sec, (sec % 2 == 0).then_some("Security")));
        store.add(
            9,
            HistoryRecord::new(Timestamp::new(sec, 0), HistoryValue::Text("same".repeat(50))),
        );
    }
    let cache = ValueCache::create(&private(1 << 20), store)?;
    let end = Timestamp::new(30, 0);

    for _ in 0..2 {
        let logs = cache.get_value_range(8, ValueType::Log, 0, 10, end)?;
        let expected: Vec<_> = (10..20)
            .rev()
            .map(|sec| log(sec, (sec % 2 == 0).then_some("Security")))
            .collect();
        assert_eq!(logs, expected);
        let texts = cache.get_value_range(9, ValueType::Text, 0, 10, end)?;
        assert!(texts
            .iter()
            .all(|v| v.value == HistoryValue::Text("same".repeat(50))));
    }
    // Per item, one read above the request end and one by count.
    assert_eq!(cache.store().reads(), 4);
    cache.arena().map_or(Ok(()), |arena| arena.lock()?.verify())?;
    Ok(())
}

#[test]
fn reset_and_removal_free_everything() -> Result<()> {
    let store = MemoryStore::new();
    for item in 0..20u64 {
        for sec in 0..30 {
            store.add(
                item,
                HistoryRecord::new(
                    Timestamp::new(1000 + sec, 0),
                    HistoryValue::Str(format!("state {}", sec % 7)),
                ),
            );
        }
    }
    let cache = ValueCache::create(&private(1 << 20), store)?;
    let initial = cache.get_statistics()?;

    for item in 0..20 {
        cache.get_value_range(item, ValueType::Str, 0, 30, Timestamp::new(2000, 0))?;
    }
    assert_eq!(cache.item_stats()?.len(), 20);
    assert!(cache.get_statistics()?.free_size < initial.free_size);

    cache.remove_items(&[0, 1, 2])?;
    assert_eq!(cache.item_stats()?.len(), 17);

    cache.reset()?;
    assert!(cache.item_stats()?.is_empty());
    let stats = cache.get_statistics()?;
    assert_eq!((stats.hits, stats.misses), (0, 0));
    assert_eq!(stats.free_size, initial.free_size);
    Ok(())
}

static LOW_MEMORY_NOW: AtomicI64 = AtomicI64::new(1_000_000);

fn low_memory_clock() -> i64 {
    LOW_MEMORY_NOW.load(Ordering::Relaxed)
}

#[test]
fn eviction_under_memory_pressure() -> Result<()> {
    let config = ValueCacheConfig {
        clock: low_memory_clock,
        ..ValueCacheConfig::private(48 << 10)
    };
    let cache = ValueCache::create(&config, uint_store(1..=200, 5000..5050))?;
    let end = Timestamp::new(6000, 0);

    for item in 1..=200 {
        let values = cache.get_value_range(item, ValueType::Uint, 0, 50, end)?;
        assert_eq!(secs(&values), (5000..5050).rev().collect::<Vec<_>>());
    }
    let stats = cache.get_statistics()?;
    assert!(stats.low_memory);
    let cached = cache.item_stats()?.len();
    assert!(cached > 0 && cached < 200);
    cache.arena().map_or(Ok(()), |arena| arena.lock()?.verify())?;

    // No new items are admitted while memory is low.
    let cached_ids: Vec<u64> = cache.item_stats()?.iter().map(|s| s.item_id).collect();
    let Some(evicted) = (1..=200).find(|id| !cached_ids.contains(id)) else {
        panic!("nothing was evicted");
    };
    let values = cache.get_value_range(evicted, ValueType::Uint, 0, 50, end)?;
    assert_eq!(values.len(), 50);
    assert_eq!(cache.item_stats()?.len(), cached);

    LOW_MEMORY_NOW.fetch_add(DAY + 1, Ordering::Relaxed);
    cache.get_value_range(2, ValueType::Uint, 0, 50, end)?;
    assert!(!cache.get_statistics()?.low_memory);
    Ok(())
}

static EXPIRY_NOW: AtomicI64 = AtomicI64::new(1_000_000);

fn expiry_clock() -> i64 {
    EXPIRY_NOW.load(Ordering::Relaxed)
}

#[test]
fn unused_items_expire_first() -> Result<()> {
    let config = ValueCacheConfig {
        clock: expiry_clock,
        ..ValueCacheConfig::private(48 << 10)
    };
    let cache = ValueCache::create(&config, uint_store(1..=18, 5000..5050))?;
    let end = Timestamp::new(6000, 0);

    for item in 1..=5 {
        cache.get_value_range(item, ValueType::Uint, 0, 50, end)?;
    }
    EXPIRY_NOW.fetch_add(2 * DAY, Ordering::Relaxed);
    for item in 6..=18 {
        cache.get_value_range(item, ValueType::Uint, 0, 50, end)?;
    }

    let ids: Vec<u64> = cache.item_stats()?.iter().map(|s| s.item_id).collect();
    assert!(ids.iter().all(|&id| id > 5));
    assert!(ids.contains(&18));
    assert!(!cache.get_statistics()?.low_memory);
    Ok(())
}

#[test]
#[cfg_attr(miri, ignore)]
fn processes_share_one_cache() -> Result<()> {
    let config = shared("share");
    let owner = ValueCache::create(&config, uint_store([11], 100..160))?;
    let other = ValueCache::attach(&config, uint_store([11], 100..160))?;
    let end = Timestamp::new(159, 0);

    let values = owner.get_value_range(11, ValueType::Uint, 30, 0, end)?;
    assert_eq!(values.len(), 30);
    assert_eq!(other.get_value_range(11, ValueType::Uint, 30, 0, end)?, values);
    assert_eq!(other.store().reads(), 0);
    assert_eq!(other.get_statistics()?.hits, 30);

    other.add_value(11, ValueType::Uint, Timestamp::new(160, 0), HistoryValue::Uint(1))?;
    let last = owner.get_value(11, ValueType::Uint, Timestamp::new(160, 0))?;
    assert_eq!(last.map(|v| v.value), Some(HistoryValue::Uint(1)));
    Ok(())
}

/// Runs a callback on the first read, while the cache is unlocked.
struct HookStore {
    inner: MemoryStore,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HistoryStore for HookStore {
    fn get_values(
        &self,
        item_id: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> anyhow::Result<Vec<HistoryRecord>> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.get_values(item_id, value_type, start, count, end)
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_fill_is_not_merged_twice() -> Result<()> {
    let config = shared("race");
    let owner = ValueCache::create(
        &config,
        HookStore {
            inner: uint_store([12], 100..130),
            hook: Mutex::new(None),
        },
    )?;
    let other = Arc::new(ValueCache::attach(&config, uint_store([12], 100..130))?);
    let end = Timestamp::new(200, 0);

    let racer = other.clone();
    *owner.store().hook.lock().unwrap() = Some(Box::new(move || {
        let values = racer
            .get_value_range(12, ValueType::Uint, 0, 10, end)
            .unwrap();
        assert_eq!(values.len(), 10);
    }));

    let values = owner.get_value_range(12, ValueType::Uint, 0, 10, end)?;
    assert_eq!(secs(&values), (120..130).rev().collect::<Vec<_>>());
    assert_eq!(owner.item_stats()?[0].values, 10);
    // The reads of the abandoned fill only.
    assert_eq!(owner.store().inner.reads(), 2);
    Ok(())
}
