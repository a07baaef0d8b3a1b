//! Connection pool keyed by `(host, port, timeout, calling thread)`.
//!
//! A connection is checked out for the duration of one exchange and only
//! returned when the exchange succeeded with status 200. When the pool
//! grows past its capacity the oldest entries are evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::debug;

/// Identity of a reusable connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub thread: ThreadId,
}

impl PoolKey {
    /// Key for the calling thread.
    pub fn current(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_ms: timeout.as_millis() as u64,
            thread: std::thread::current().id(),
        }
    }
}

#[derive(Debug)]
struct Entry<C> {
    opened: Instant,
    conn: C,
}

/// Pool of idle connections of type `C`.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    entries: Mutex<HashMap<PoolKey, Entry<C>>>,
    capacity: usize,
    evict: usize,
}

impl<C> ConnectionPool<C> {
    pub fn new(capacity: usize, evict: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            evict: evict.max(1),
        }
    }

    /// Take the idle connection for `key`, with the instant it was opened.
    pub fn checkout(&self, key: &PoolKey) -> Option<(C, Instant)> {
        let mut entries = self.entries.lock().expect("pool lock");
        entries.remove(key).map(|e| (e.conn, e.opened))
    }

    /// Return a healthy connection to the pool.
    pub fn checkin(&self, key: PoolKey, conn: C, opened: Instant) {
        let mut entries = self.entries.lock().expect("pool lock");
        entries.insert(key, Entry { opened, conn });
        if entries.len() > self.capacity {
            let mut by_age: Vec<(PoolKey, Instant)> =
                entries.iter().map(|(k, e)| (k.clone(), e.opened)).collect();
            by_age.sort_by_key(|(_, opened)| *opened);
            for (key, _) in by_age.into_iter().take(self.evict) {
                entries.remove(&key);
            }
            debug!(remaining = entries.len(), "evicted oldest pooled connections");
        }
    }

    /// Drop the idle connection for `key`, if any.
    pub fn discard(&self, key: &PoolKey) {
        self.entries.lock().expect("pool lock").remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
