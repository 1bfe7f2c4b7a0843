//! Read-through cache of raw contexts and merged views.
//!
//! Every entry remembers the version stamp of each context it was built
//! from. Writes update a version index synchronously, and a read only serves
//! an entry whose stamps all still match the index, so a hit never touches
//! the store and never returns data older than the last committed write.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_core::settings::CacheSettings;
use strata_core::{Change, ChangeType, Context, ContextError, ContextKey, ContextStore, Result};

use crate::resolver::{MergedView, Resolver};

/// Identity of one committed state of a context. `updated_at` distinguishes
/// a re-created context from the one deleted before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stamp {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Stamp {
    pub fn of(ctx: &Context) -> Self {
        Self {
            version: ctx.version,
            updated_at: ctx.updated_at,
        }
    }

    /// Commit order of two states of one key.
    pub fn is_newer_than(&self, other: &Stamp) -> bool {
        (self.updated_at, self.version) > (other.updated_at, other.version)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IndexState {
    Live(Stamp),
    Deleted(Stamp),
}

impl IndexState {
    fn stamp(&self) -> &Stamp {
        match self {
            IndexState::Live(stamp) | IndexState::Deleted(stamp) => stamp,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct IndexSlot {
    state: IndexState,
    touched_at: Instant,
}

impl IndexSlot {
    fn new(state: IndexState) -> Self {
        Self {
            state,
            touched_at: Instant::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    bytes: Arc<[u8]>,
    compressed: bool,
    depends_on: Arc<[(ContextKey, Stamp)]>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }

    pub fn depends_on(&self, key: &ContextKey) -> bool {
        self.depends_on.iter().any(|(k, _)| k == key)
    }
}

/// Storage for cache entries. Failures surface as `CacheUnavailable`, which
/// the cache logs and bypasses.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    fn insert(&self, key: String, entry: CacheEntry) -> Result<()>;
    fn remove(&self, key: &str) -> Result<bool>;
    /// Keep entries for which `keep` returns true; returns how many were removed.
    fn retain(&self, keep: &mut dyn FnMut(&str, &CacheEntry) -> bool) -> Result<usize>;
    fn clear(&self) -> Result<()>;
    fn len(&self) -> usize;
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn insert(&self, key: String, entry: CacheEntry) -> Result<()> {
        let _ = self.entries.insert(key, entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn retain(&self, keep: &mut dyn FnMut(&str, &CacheEntry) -> bool) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|k, v| keep(k.as_str(), &*v));
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache in front of a [`ContextStore`] and the [`Resolver`].
pub struct CacheLayer {
    store: Arc<dyn ContextStore>,
    resolver: Resolver,
    backend: Arc<dyn CacheBackend>,
    index: DashMap<ContextKey, IndexSlot>,
    /// Index size that triggers the next trim.
    index_limit: AtomicUsize,
    settings: CacheSettings,
    counters: Counters,
}

impl CacheLayer {
    pub fn new(
        store: Arc<dyn ContextStore>,
        resolver: Resolver,
        backend: Arc<dyn CacheBackend>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            backend,
            index: DashMap::new(),
            index_limit: AtomicUsize::new(min_index_limit(&settings)),
            settings,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    /// Raw context, read through the cache.
    pub fn get(&self, key: &ContextKey) -> Result<Context> {
        let cache_key = format!("ctx:{key}");
        if let Some(ctx) = self.lookup::<Context>(&cache_key) {
            return Ok(ctx);
        }
        let ctx = self.store.get(key)?;
        self.populate(cache_key, &ctx, vec![(ctx.key.clone(), Stamp::of(&ctx))]);
        Ok(ctx)
    }

    /// Own or inherited view of `key`. Ancestors are fetched through the
    /// raw-context path, so a cold view over a warm chain costs one store read.
    pub fn get_or_resolve(&self, key: &ContextKey, include_inherited: bool) -> Result<MergedView> {
        if !include_inherited {
            return self.get(key).map(|ctx| MergedView::own(&ctx));
        }

        let cache_key = format!("view:{key}");
        if let Some(view) = self.lookup::<MergedView>(&cache_key) {
            return Ok(view);
        }

        let chain = self.resolver.chain(key, |k| match self.get(k) {
            Ok(ctx) => Ok(Some(ctx)),
            Err(ContextError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })?;
        let view = self.resolver.merge(&chain)?;
        let stamps = chain.iter().map(|c| (c.key.clone(), Stamp::of(c))).collect();
        self.populate(cache_key, &view, stamps);
        Ok(view)
    }

    /// Apply committed changes: advance the version index, then drop every
    /// entry the changed contexts feed into. The index never moves back, so
    /// changes applied out of commit order leave it at the newest state.
    pub fn apply_changes(&self, changes: &[Change]) {
        for change in changes {
            let stamp = Stamp::of(&change.context);
            let state = match change.change_type {
                ChangeType::Delete => IndexState::Deleted(stamp),
                _ => IndexState::Live(stamp),
            };
            self.index
                .entry(change.context.key.clone())
                .and_modify(|slot| {
                    if stamp.is_newer_than(slot.state.stamp()) {
                        *slot = IndexSlot::new(state);
                    }
                })
                .or_insert_with(|| IndexSlot::new(state));
            self.invalidate_subtree(&change.context.key);
        }
        self.trim_index();
    }

    pub fn invalidate(&self, key: &ContextKey) {
        for cache_key in [format!("ctx:{key}"), format!("view:{key}")] {
            if let Err(e) = self.backend.remove(&cache_key) {
                self.bypass("invalidate", &e);
            }
        }
    }

    /// Drop `key`'s entries and every merged view built on top of it.
    pub fn invalidate_subtree(&self, key: &ContextKey) {
        self.invalidate(key);
        match self.backend.retain(&mut |_, entry| !entry.depends_on(key)) {
            Ok(removed) if removed > 0 => debug!(key = %key, removed, "invalidated dependent entries"),
            Ok(_) => {}
            Err(e) => self.bypass("invalidate_subtree", &e),
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.backend.clear() {
            self.bypass("clear", &e);
        }
        self.index.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.backend.len(),
        }
    }

    fn lookup<T: DeserializeOwned>(&self, cache_key: &str) -> Option<T> {
        if !self.settings.enabled {
            return None;
        }
        let entry = match self.backend.get(cache_key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.bypass("get", &e);
                return None;
            }
        };

        if entry.is_expired() || !self.is_current(&entry) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if entry.is_expired() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            if let Err(e) = self.backend.remove(cache_key) {
                self.bypass("remove", &e);
            }
            return None;
        }

        match decode(&entry) {
            Ok(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key, "cache hit");
                Some(value)
            }
            Err(e) => {
                self.bypass("decode", &e);
                if let Err(e) = self.backend.remove(cache_key) {
                    self.bypass("remove", &e);
                }
                None
            }
        }
    }

    fn populate<T: Serialize>(&self, cache_key: String, value: &T, stamps: Vec<(ContextKey, Stamp)>) {
        if !self.settings.enabled {
            return;
        }
        // Warm the index from what the read observed; writes always win.
        for (key, stamp) in &stamps {
            self.index
                .entry(key.clone())
                .or_insert_with(|| IndexSlot::new(IndexState::Live(*stamp)));
        }
        let entry = match encode(value, &stamps, &self.settings) {
            Ok(entry) => entry,
            Err(e) => {
                self.bypass("encode", &e);
                return;
            }
        };
        if !self.is_current(&entry) {
            // A write landed while this value was being built.
            return;
        }
        self.make_room();
        if let Err(e) = self.backend.insert(cache_key, entry) {
            self.bypass("insert", &e);
        }
        self.trim_index();
    }

    fn is_current(&self, entry: &CacheEntry) -> bool {
        entry.depends_on.iter().all(|(key, stamp)| {
            matches!(
                self.index.get(key).as_deref(),
                Some(IndexSlot { state: IndexState::Live(current), .. }) if current == stamp
            )
        })
    }

    fn make_room(&self) {
        if self.backend.len() < self.settings.max_entries {
            return;
        }
        let mut evicted = self.retain_entries("evict", &mut |_, entry| !entry.is_expired());
        if self.backend.len() >= self.settings.max_entries {
            // Still full: drop everything older than the newest half.
            let mut ages = Vec::new();
            self.retain_entries("evict", &mut |_, entry| {
                ages.push(entry.inserted_at);
                true
            });
            ages.sort_unstable();
            if let Some(cutoff) = ages.get(ages.len() / 2).copied() {
                evicted += self.retain_entries("evict", &mut |_, entry| entry.inserted_at >= cutoff);
            }
        }
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "cache full, evicted entries");
        }
    }

    fn retain_entries(&self, op: &str, keep: &mut dyn FnMut(&str, &CacheEntry) -> bool) -> usize {
        match self.backend.retain(keep) {
            Ok(removed) => removed,
            Err(e) => {
                self.bypass(op, &e);
                0
            }
        }
    }

    /// Drop index slots no cached entry depends on once they are older than
    /// the TTL. Tombstones go the same way. Runs when the index outgrows its
    /// limit, which then doubles past the surviving size.
    fn trim_index(&self) {
        if self.index.len() < self.index_limit.load(Ordering::Relaxed) {
            return;
        }
        let mut referenced = HashSet::new();
        self.retain_entries("trim_index", &mut |_, entry| {
            referenced.extend(entry.depends_on.iter().map(|(key, _)| key.clone()));
            true
        });
        let ttl = Duration::from_secs(self.settings.ttl_secs);
        let before = self.index.len();
        self.index
            .retain(|key, slot| referenced.contains(key) || slot.touched_at.elapsed() <= ttl);
        let after = self.index.len();
        self.index_limit
            .store(min_index_limit(&self.settings).max(after * 2), Ordering::Relaxed);
        debug!(dropped = before.saturating_sub(after), remaining = after, "trimmed version index");
    }

    fn bypass(&self, op: &str, err: &ContextError) {
        self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
        warn!(op, error = %err, "cache unavailable, bypassing");
    }
}

fn min_index_limit(settings: &CacheSettings) -> usize {
    settings.max_entries.saturating_mul(2).max(64)
}

fn encode<T: Serialize>(value: &T, stamps: &[(ContextKey, Stamp)], settings: &CacheSettings) -> Result<CacheEntry> {
    let raw = serde_json::to_vec(value).map_err(|e| ContextError::CacheUnavailable(format!("serialize: {e}")))?;
    let (bytes, compressed) = if raw.len() > settings.compression_threshold_bytes {
        (compress(&raw)?, true)
    } else {
        (raw, false)
    };
    Ok(CacheEntry {
        bytes: bytes.into(),
        compressed,
        depends_on: stamps.to_vec().into(),
        inserted_at: Instant::now(),
        ttl: Duration::from_secs(settings.ttl_secs),
    })
}

fn decode<T: DeserializeOwned>(entry: &CacheEntry) -> Result<T> {
    let parsed = if entry.compressed {
        serde_json::from_slice(&decompress(&entry.bytes)?)
    } else {
        serde_json::from_slice(&entry.bytes)
    };
    parsed.map_err(|e| ContextError::CacheUnavailable(format!("deserialize: {e}")))
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(bytes)
        .map_err(|e| ContextError::CacheUnavailable(format!("compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ContextError::CacheUnavailable(format!("compress: {e}")))
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ContextError::CacheUnavailable(format!("decompress: {e}")))?;
    Ok(out)
}
