use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use common::lru::{LruCache, RemovalListener};
use tracing::debug;

use crate::resultset::column::ColumnInformation;

/// Server-side prepared statement handle, shared between the PS cache and
/// every live prepared statement over the same SQL. The share counter
/// starts at 1 for the creator; the cache takes its own reference. The
/// server-side handle is released only when the last reference of an
/// entry already expelled from the cache goes away.
#[derive(Debug)]
pub struct ServerPrepareResult {
    statement_id: u32,
    sql: String,
    database: String,
    parameter_count: usize,
    param_meta: Vec<ColumnInformation>,
    columns: Mutex<Arc<Vec<ColumnInformation>>>,
    share_counter: AtomicI32,
    added_to_cache: AtomicBool,
    removed_from_cache: AtomicBool,
}

impl ServerPrepareResult {
    pub fn new(
        statement_id: u32,
        sql: String,
        database: String,
        param_meta: Vec<ColumnInformation>,
        columns: Vec<ColumnInformation>,
    ) -> ServerPrepareResult {
        ServerPrepareResult {
            statement_id,
            sql,
            database,
            parameter_count: param_meta.len(),
            param_meta,
            columns: Mutex::new(Arc::new(columns)),
            share_counter: AtomicI32::new(1),
            added_to_cache: AtomicBool::new(false),
            removed_from_cache: AtomicBool::new(false),
        }
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn parameter_meta(&self) -> &[ColumnInformation] {
        &self.param_meta
    }

    pub fn columns(&self) -> Arc<Vec<ColumnInformation>> {
        self.columns.lock().unwrap().clone()
    }

    /// Result metadata can change between executions; re-stamped on every
    /// execute that returns a result set.
    pub fn set_columns(&self, columns: Vec<ColumnInformation>) {
        *self.columns.lock().unwrap() = Arc::new(columns);
    }

    /// Take a new reference. Fails when the entry was already expelled
    /// from the cache, in which case the caller must not use it.
    pub fn increment_share_counter(&self) -> bool {
        if self.removed_from_cache.load(Ordering::Acquire) {
            return false;
        }
        self.share_counter.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Drop a reference. True when the handle is now deallocatable: no
    /// references left and no longer cached.
    pub fn decrement_share_counter(&self) -> bool {
        let remaining = self.share_counter.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining <= 0 && self.removed_from_cache.load(Ordering::Acquire)
    }

    pub fn share_counter(&self) -> i32 {
        self.share_counter.load(Ordering::Acquire)
    }

    pub fn set_added_to_cache(&self) {
        self.added_to_cache.store(true, Ordering::Release);
    }

    pub fn set_removed_from_cache(&self) {
        self.removed_from_cache.store(true, Ordering::Release);
    }

    pub fn is_in_cache(&self) -> bool {
        self.added_to_cache.load(Ordering::Acquire)
            && !self.removed_from_cache.load(Ordering::Acquire)
    }

    pub fn can_be_deallocated(&self) -> bool {
        self.share_counter.load(Ordering::Acquire) <= 0
            && self.removed_from_cache.load(Ordering::Acquire)
    }
}

/// Eviction hook: expelled entries lose the cache's reference; when nobody
/// else holds one, the server-side handle is queued for COM_STMT_CLOSE at
/// the next command prologue.
struct PsRemover {
    release_queue: Arc<Mutex<Vec<u32>>>,
}

impl RemovalListener<Arc<ServerPrepareResult>> for PsRemover {
    fn on_remove(&self, value: &Arc<ServerPrepareResult>) {
        value.set_removed_from_cache();
        if value.decrement_share_counter() {
            debug!(
                "prepared statement {} queued for server-side release",
                value.statement_id()
            );
            self.release_queue.lock().unwrap().push(value.statement_id());
        }
    }
}

/// LRU of server prepared statements, keyed `database + "-" + sql`.
/// Oversize keys are not cached.
pub struct PsCache {
    inner: Mutex<LruCache<String, Arc<ServerPrepareResult>, PsRemover>>,
    max_key_len: usize,
}

impl PsCache {
    pub fn new(
        max_size: usize,
        max_key_len: usize,
        release_queue: Arc<Mutex<Vec<u32>>>,
    ) -> PsCache {
        PsCache {
            inner: Mutex::new(LruCache::with_remover(
                max_size.max(1),
                PsRemover { release_queue },
            )),
            max_key_len,
        }
    }

    fn key(database: &str, sql: &str) -> String {
        format!("{database}-{sql}")
    }

    /// Lookup-and-promote; a hit hands out an extra reference.
    pub fn get(&self, database: &str, sql: &str) -> Option<Arc<ServerPrepareResult>> {
        let key = Self::key(database, sql);
        if key.len() > self.max_key_len {
            return None;
        }
        let mut cache = self.inner.lock().unwrap();
        let cached = cache.get(&key)?;
        if cached.increment_share_counter() {
            Some(cached)
        } else {
            None
        }
    }

    /// Cache a freshly prepared entry. When another preparation of the
    /// same SQL won the race, that cached entry is returned instead and
    /// the caller keeps full responsibility for its own `entry`.
    pub fn put(
        &self,
        database: &str,
        sql: &str,
        entry: Arc<ServerPrepareResult>,
    ) -> Arc<ServerPrepareResult> {
        let key = Self::key(database, sql);
        if key.len() > self.max_key_len {
            return entry;
        }
        let mut cache = self.inner.lock().unwrap();
        if let Some(cached) = cache.put(key.clone(), entry.clone()) {
            if cached.increment_share_counter() {
                return cached;
            }
            // cached entry already expelled concurrently: last writer wins
            cache.remove(&key);
            cache.put(key, entry.clone());
        }
        entry.set_added_to_cache();
        entry.increment_share_counter();
        entry
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, sql: &str) -> Arc<ServerPrepareResult> {
        Arc::new(ServerPrepareResult::new(
            id,
            sql.to_string(),
            "test".to_string(),
            Vec::new(),
            Vec::new(),
        ))
    }

    fn cache(size: usize) -> (PsCache, Arc<Mutex<Vec<u32>>>) {
        let queue = Arc::new(Mutex::new(Vec::new()));
        (PsCache::new(size, 1024, queue.clone()), queue)
    }

    #[test]
    pub fn test_put_get_share_accounting() {
        let (cache, _queue) = cache(4);
        let prepared = entry(1, "INSERT INTO t(val) VALUES('x')");
        assert_eq!(prepared.share_counter(), 1);
        let stored = cache.put("test", prepared.sql(), prepared.clone());
        assert!(Arc::ptr_eq(&stored, &prepared));
        // creator + cache
        assert_eq!(prepared.share_counter(), 2);

        let hit = cache.get("test", "INSERT INTO t(val) VALUES('x')").unwrap();
        assert!(Arc::ptr_eq(&hit, &prepared));
        assert_eq!(prepared.share_counter(), 3);
        assert!(cache.get("test", "SELECT 2").is_none());
    }

    #[test]
    pub fn test_second_put_returns_cached_entry() {
        let (cache, _queue) = cache(4);
        let first = entry(1, "SELECT ?");
        cache.put("test", "SELECT ?", first.clone());
        let second = entry(2, "SELECT ?");
        let resolved = cache.put("test", "SELECT ?", second.clone());
        assert!(Arc::ptr_eq(&resolved, &first));
        // the losing preparation stays un-cached, its accounting untouched
        assert_eq!(second.share_counter(), 1);
        assert!(!second.is_in_cache());
    }

    #[test]
    pub fn test_eviction_defers_release_until_unshared() {
        let (cache, queue) = cache(2);
        let insert = entry(11, "INSERT");
        cache.put("test", "INSERT", insert.clone());
        cache.put("test", "S1", entry(12, "S1"));
        // both statements still referenced by their creators; fill cache
        cache.put("test", "S2", entry(13, "S2"));
        // INSERT evicted: cache reference dropped, creator still holds one
        assert!(!insert.is_in_cache());
        assert_eq!(insert.share_counter(), 1);
        assert!(queue.lock().unwrap().is_empty());
        // creator closes: now the server-side handle can go
        assert!(insert.decrement_share_counter());
    }

    #[test]
    pub fn test_eviction_releases_abandoned_entry() {
        let (cache, queue) = cache(1);
        let old = entry(21, "OLD");
        cache.put("test", "OLD", old.clone());
        // creator drops its reference while the entry is still cached
        assert!(!old.decrement_share_counter());
        cache.put("test", "NEW", entry(22, "NEW"));
        assert_eq!(queue.lock().unwrap().as_slice(), &[21]);
    }

    #[test]
    pub fn test_increment_fails_after_removal() {
        let prepared = entry(1, "S");
        prepared.set_removed_from_cache();
        assert!(!prepared.increment_share_counter());
    }

    #[test]
    pub fn test_oversize_key_not_cached() {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let cache = PsCache::new(4, 10, queue);
        let prepared = entry(1, "SELECT 'way too long for the key limit'");
        let stored = cache.put("test", prepared.sql(), prepared.clone());
        assert!(Arc::ptr_eq(&stored, &prepared));
        assert!(cache.is_empty());
        assert_eq!(prepared.share_counter(), 1);
    }

    #[test]
    pub fn test_clear_releases_unreferenced_entries() {
        let (cache, queue) = cache(4);
        let prepared = entry(31, "S");
        cache.put("test", "S", prepared.clone());
        assert!(!prepared.decrement_share_counter());
        cache.clear();
        assert_eq!(queue.lock().unwrap().as_slice(), &[31]);
    }
}
