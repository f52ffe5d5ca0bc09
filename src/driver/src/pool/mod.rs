pub mod data_source;

pub use data_source::MariaDbDataSource;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nanoid::nanoid;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{ErrorKind, Result, SqlError};
use crate::options::Options;
use crate::url::UrlParser;

struct IdleEntry {
    id: String,
    conn: Connection,
    returned_at: Instant,
}

struct PoolInner {
    url: Arc<UrlParser>,
    opts: Arc<Options>,
    /// tail = most recently returned; borrows pop the tail for TCP warmth
    idle: Mutex<Vec<IdleEntry>>,
    /// borrowed + idle
    total: AtomicUsize,
    available: Condvar,
    closed: AtomicBool,
}

/// Thread-safe connection pool: between `minPoolSize` and `maxPoolSize`
/// live connections, Condvar-blocking borrows, an idle reaper and session
/// reset on give-back.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(url: Arc<UrlParser>) -> Pool {
        let opts = url.options().clone();
        let inner = Arc::new(PoolInner {
            url,
            opts,
            idle: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        spawn_reaper(&inner);
        Pool { inner }
    }

    pub fn total_connections(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Borrow a connection; blocks up to `connectTimeout` when the pool is
    /// at `maxPoolSize` with nothing idle.
    pub fn get_connection(&self) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.inner.opts.connect_timeout;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(SqlError::closed_explicitly("getConnection"));
            }

            // 1. most recently returned idle connection
            let candidate = self.inner.idle.lock().unwrap().pop();
            if let Some(entry) = candidate {
                let stale = entry.returned_at.elapsed() > self.inner.opts.test_min_removal_delay;
                if stale && !entry.conn.is_valid(Duration::from_secs(1)).unwrap_or(false) {
                    debug!("discarding dead pooled connection {}", entry.id);
                    entry.conn.close();
                    self.inner.total.fetch_sub(1, Ordering::AcqRel);
                    self.inner.available.notify_one();
                    continue;
                }
                return Ok(PooledConnection {
                    id: entry.id,
                    conn: Some(entry.conn),
                    pool: self.inner.clone(),
                });
            }

            // 2. grow while below maxPoolSize
            let grown = self
                .inner
                .total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                    (total < self.inner.opts.max_pool_size).then_some(total + 1)
                })
                .is_ok();
            if grown {
                match Connection::from_url(self.inner.url.clone()) {
                    Ok(conn) => {
                        return Ok(PooledConnection {
                            id: nanoid!(),
                            conn: Some(conn),
                            pool: self.inner.clone(),
                        })
                    }
                    Err(err) => {
                        self.inner.total.fetch_sub(1, Ordering::AcqRel);
                        self.inner.available.notify_one();
                        return Err(err);
                    }
                }
            }

            // 3. wait for a give-back
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(SqlError::new(
                        ErrorKind::TransientConnection,
                        format!(
                            "No connection available within {} ms (pool of {} in use)",
                            self.inner.opts.connect_timeout.as_millis(),
                            self.inner.opts.max_pool_size
                        ),
                        "08000",
                        0,
                    ))
                }
            };
            let guard = self.inner.idle.lock().unwrap();
            if guard.is_empty() {
                let (_guard, _timeout) = self
                    .inner
                    .available
                    .wait_timeout(guard, remaining)
                    .unwrap();
            }
        }
    }

    /// Close every pooled connection; waiters fail fast.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut idle = self.inner.idle.lock().unwrap();
        for entry in idle.drain(..) {
            entry.conn.close();
            self.inner.total.fetch_sub(1, Ordering::AcqRel);
        }
        drop(idle);
        self.inner.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn give_back(pool: &Arc<PoolInner>, id: String, conn: Connection) {
    if pool.closed.load(Ordering::Acquire) || conn.is_closed() {
        conn.close();
        pool.total.fetch_sub(1, Ordering::AcqRel);
        pool.available.notify_one();
        return;
    }
    // clean session state; the server also forgets prepared statements
    match conn.reset_for_reuse() {
        Ok(()) => {
            let mut idle = pool.idle.lock().unwrap();
            idle.push(IdleEntry {
                id,
                conn,
                returned_at: Instant::now(),
            });
            drop(idle);
            pool.available.notify_one();
        }
        Err(err) => {
            warn!("pooled connection {id} failed reset, closing: {err}");
            conn.close();
            pool.total.fetch_sub(1, Ordering::AcqRel);
            pool.available.notify_one();
        }
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) {
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let delay = inner.opts.test_min_removal_delay.max(Duration::from_secs(1));
    std::thread::Builder::new()
        .name("mariadb-pool-reaper".to_string())
        .spawn(move || loop {
            std::thread::sleep(delay);
            let Some(pool) = weak.upgrade() else {
                return;
            };
            if pool.closed.load(Ordering::Acquire) {
                return;
            }
            reap_idle(&pool);
        })
        .expect("failed to spawn pool reaper");
}

/// Close connections idle beyond `maxIdleTime`, never shrinking below
/// `minPoolSize`.
fn reap_idle(pool: &Arc<PoolInner>) {
    let min_pool_size = pool.opts.effective_min_pool_size();
    let max_idle_time = pool.opts.max_idle_time;
    let mut victims = Vec::new();
    {
        let mut idle = pool.idle.lock().unwrap();
        // oldest entries sit at the front
        while pool.total.load(Ordering::Acquire) > min_pool_size {
            match idle.first() {
                Some(entry) if entry.returned_at.elapsed() > max_idle_time => {
                    victims.push(idle.remove(0));
                    pool.total.fetch_sub(1, Ordering::AcqRel);
                }
                _ => break,
            }
        }
    }
    for victim in victims {
        debug!("reaping idle pooled connection {}", victim.id);
        victim.conn.close();
        pool.available.notify_one();
    }
}

/// Borrowed pool entry. `close` (and drop) give the physical connection
/// back to the pool instead of closing it.
pub struct PooledConnection {
    id: String,
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

impl PooledConnection {
    /// Return to the pool; the underlying connection stays open.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            give_back(&self.pool, std::mem::take(&mut self.id), conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Process-wide pool registry, keyed by normalized URL plus the semantic
/// property subset. Lazily constructed, explicitly shut down.
fn registry() -> &'static DashMap<String, Pool> {
    static POOLS: OnceLock<DashMap<String, Pool>> = OnceLock::new();
    POOLS.get_or_init(DashMap::new)
}

/// Pool for this URL, shared across the process.
pub fn retrieve_pool(url: &Arc<UrlParser>) -> Pool {
    let key = url.pool_key();
    registry()
        .entry(key)
        .or_insert_with(|| Pool::new(url.clone()))
        .clone()
}

/// Tear down every registered pool (library shutdown).
pub fn close_all_pools() {
    for entry in registry().iter() {
        entry.value().close();
    }
    registry().clear();
}

pub(crate) fn remove_pool(url: &Arc<UrlParser>) {
    if let Some((_, pool)) = registry().remove(&url.pool_key()) {
        pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(extra: &str) -> Arc<UrlParser> {
        Arc::new(
            UrlParser::parse(
                &format!("jdbc:mariadb://localhost/test{extra}"),
                &BTreeMap::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    pub fn test_registry_shares_pools_per_key() {
        let a = retrieve_pool(&url("?maxPoolSize=3&user=a"));
        let b = retrieve_pool(&url("?maxPoolSize=3&user=a"));
        let c = retrieve_pool(&url("?maxPoolSize=3&user=other"));
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        close_all_pools();
    }

    #[test]
    pub fn test_pool_close_rejects_borrow() {
        let pool = Pool::new(url("?maxPoolSize=1"));
        pool.close();
        let err = pool.get_connection().unwrap_err();
        assert!(err.sql_state().starts_with("08"));
    }
}
