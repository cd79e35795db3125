//! Thread-to-database association and flush-all coordination.
//!
//! Every ingesting thread gets its own [`AggregateDb`], installed in a
//! thread-local slot and shared into a lock-guarded global list for
//! fan-in during flush. Thread exit only marks the database retired;
//! reclamation happens lazily at the next flush so exit callbacks never
//! touch the list or the heap while a flush may be running.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::db::{AggregateDb, DbStats, StatsAttributes};
use crate::host::{Attribute, Host};

/// Global statistics folded from each database at flush.
///
/// The fold counters are written only by the flusher; the dropped
/// counter also absorbs routing-time drops from ingest threads.
#[derive(Default)]
pub struct GlobalStats {
    trie_entries: AtomicUsize,
    kernel_entries: AtomicUsize,
    trie_blocks: AtomicUsize,
    kernel_blocks: AtomicUsize,
    dropped: AtomicUsize,
    max_keylen: AtomicUsize,
}

/// Plain copy of the global statistics for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStatsSnapshot {
    pub trie_entries: usize,
    pub kernel_entries: usize,
    pub trie_blocks: usize,
    pub kernel_blocks: usize,
    pub dropped: usize,
    pub max_keylen: usize,
}

impl GlobalStats {
    fn fold(&self, stats: &DbStats) {
        self.trie_entries
            .fetch_add(stats.trie_entries, Ordering::Relaxed);
        self.kernel_entries
            .fetch_add(stats.kernel_entries, Ordering::Relaxed);
        self.trie_blocks
            .fetch_add(stats.trie_blocks, Ordering::Relaxed);
        self.kernel_blocks
            .fetch_add(stats.kernel_blocks, Ordering::Relaxed);
        self.dropped.fetch_add(stats.dropped, Ordering::Relaxed);
        self.max_keylen
            .fetch_max(stats.max_keylen, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            trie_entries: self.trie_entries.load(Ordering::Relaxed),
            kernel_entries: self.kernel_entries.load(Ordering::Relaxed),
            trie_blocks: self.trie_blocks.load(Ordering::Relaxed),
            kernel_blocks: self.kernel_blocks.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            max_keylen: self.max_keylen.load(Ordering::Relaxed),
        }
    }
}

struct RegistryInner {
    dbs: Mutex<Vec<Arc<AggregateDb>>>,
    stats: GlobalStats,
}

/// The per-thread slot holding the owning database handle.
///
/// Dropping the slot at thread exit marks the database retired without
/// freeing it; the next flush unlinks and drops it. The entry is taken
/// out of the cell around every access, so a signal arriving in that
/// window observes an empty slot and the sample is dropped rather than
/// racing the update.
struct ThreadSlot {
    entry: Cell<Option<(usize, Arc<AggregateDb>)>>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some((_, db)) = self.entry.take() {
            db.set_retired();
        }
    }
}

thread_local! {
    static THREAD_DB: ThreadSlot = const {
        ThreadSlot {
            entry: Cell::new(None),
        }
    };
}

/// Owns the global database list and the thread association protocol.
pub struct Registry {
    inner: Arc<RegistryInner>,
    aggr_attr_names: Vec<String>,
}

impl Registry {
    pub fn new(aggr_attr_names: Vec<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dbs: Mutex::new(Vec::new()),
                stats: GlobalStats::default(),
            }),
            aggr_attr_names,
        }
    }

    /// Identity token distinguishing this registry's slot entries from
    /// those of a previously registered service on the same thread.
    fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Returns the current thread's database, creating and listing a
    /// new one when `alloc` is set.
    pub fn acquire(&self, host: &dyn Host, alloc: bool) -> Option<Arc<AggregateDb>> {
        let token = self.token();

        let existing = THREAD_DB.with(|slot| {
            let entry = slot.entry.take();
            let found = match &entry {
                Some((owner, db)) if *owner == token => Some(db.clone()),
                _ => None,
            };
            slot.entry.set(entry);
            found
        });
        if existing.is_some() || !alloc {
            return existing;
        }

        let db = Arc::new(AggregateDb::new(host, &self.aggr_attr_names));

        THREAD_DB.with(|slot| {
            // A leftover database from an earlier registry is retired;
            // its own flush cycle reclaims it.
            if let Some((_, stale)) = slot.entry.take() {
                stale.set_retired();
            }
            slot.entry.set(Some((token, db.clone())));
        });

        self.inner.dbs.lock().push(db.clone());
        Some(db)
    }

    /// Flushes every database: stop, drain, fold statistics, clear, and
    /// reclaim the retired ones. Returns the number of emitted records.
    ///
    /// Only per-database atomicity is guaranteed; threads whose database
    /// is not currently stopped keep ingesting into their own.
    pub fn flush_all(
        &self,
        host: &dyn Host,
        key_attrs: &[Option<Attribute>],
        stats_attrs: &[StatsAttributes],
        count_attr: &Attribute,
    ) -> usize {
        let dbs: Vec<Arc<AggregateDb>> = self.inner.dbs.lock().clone();
        let mut emitted = 0usize;

        for db in &dbs {
            db.set_stopped(true);

            match db.flush(host, key_attrs, stats_attrs, count_attr) {
                Ok(n) => emitted += n,
                Err(err) => {
                    error!(error = %err, "aggregate: aborted database flush");
                }
            }

            self.inner.stats.fold(&db.stats());
            db.clear();
            db.set_stopped(false);

            if db.retired() {
                self.inner.dbs.lock().retain(|d| !Arc::ptr_eq(d, db));
            }
        }

        info!(records = emitted, "aggregate: flushed snapshots");
        emitted
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.inner.stats
    }

    /// Number of databases currently linked.
    pub fn num_dbs(&self) -> usize {
        self.inner.dbs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::TestHost;
    use crate::host::{AttrType, Snapshot, Value};

    fn count_attr(host: &TestHost) -> Attribute {
        host.create_attribute("count", AttrType::Uint, 0)
    }

    #[test]
    fn test_acquire_reuses_thread_database() {
        let host = TestHost::new();
        let registry = Registry::new(Vec::new());

        let a = registry.acquire(&host, true).expect("created");
        let b = registry.acquire(&host, true).expect("reused");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.num_dbs(), 1);
    }

    #[test]
    fn test_acquire_without_alloc_returns_none_on_fresh_thread() {
        let host = TestHost::new();
        let registry = Registry::new(Vec::new());

        std::thread::spawn(move || {
            assert!(registry.acquire(&host, false).is_none());
            assert_eq!(registry.num_dbs(), 0);
        })
        .join()
        .expect("worker");
    }

    #[test]
    fn test_new_registry_replaces_stale_slot() {
        let host = TestHost::new();

        let first = Registry::new(Vec::new());
        let old = first.acquire(&host, true).expect("created");

        let second = Registry::new(Vec::new());
        let new = second.acquire(&host, true).expect("created");

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.retired());
        assert_eq!(second.num_dbs(), 1);
    }

    #[test]
    fn test_thread_exit_retires_but_keeps_database_listed() {
        let host = Arc::new(TestHost::new());
        let registry = Arc::new(Registry::new(Vec::new()));

        let worker_db = {
            let host = host.clone();
            let registry = registry.clone();
            std::thread::spawn(move || registry.acquire(&*host, true).expect("created"))
                .join()
                .expect("worker")
        };

        assert!(worker_db.retired());
        assert_eq!(registry.num_dbs(), 1);
    }

    #[test]
    fn test_flush_all_reclaims_retired_databases() {
        let host = Arc::new(TestHost::new());
        let registry = Arc::new(Registry::new(Vec::new()));
        let count = count_attr(&host);

        {
            let host = host.clone();
            let registry = registry.clone();
            std::thread::spawn(move || {
                let db = registry.acquire(&*host, true).expect("created");
                let mut snap = Snapshot::new();
                let node = host.add_node(5, 1, Value::Uint(5), None);
                snap.push_node(node);
                db.process(&*host, &snap, &[], false);
            })
            .join()
            .expect("worker");
        }

        assert_eq!(registry.num_dbs(), 1);
        let emitted = registry.flush_all(&*host, &[], &[], &count);
        assert_eq!(emitted, 1);
        assert_eq!(registry.num_dbs(), 0);
        assert_eq!(host.emitted_count(), 1);
    }

    #[test]
    fn test_flush_all_folds_global_statistics() {
        let host = TestHost::new();
        let registry = Registry::new(Vec::new());
        let count = count_attr(&host);

        let db = registry.acquire(&host, true).expect("created");
        let node = host.add_node(5, 1, Value::Uint(5), None);
        let mut snap = Snapshot::new();
        snap.push_node(node);
        db.process(&host, &snap, &[], false);

        registry.flush_all(&host, &[], &[], &count);
        let stats = registry.stats().snapshot();
        assert!(stats.trie_entries > 0);
        assert!(stats.trie_blocks > 0);
        assert!(stats.max_keylen > 0);
    }

    #[test]
    fn test_second_flush_emits_nothing() {
        let host = TestHost::new();
        let registry = Registry::new(Vec::new());
        let count = count_attr(&host);

        let db = registry.acquire(&host, true).expect("created");
        let node = host.add_node(5, 1, Value::Uint(5), None);
        let mut snap = Snapshot::new();
        snap.push_node(node);
        db.process(&host, &snap, &[], false);

        assert_eq!(registry.flush_all(&host, &[], &[], &count), 1);
        assert_eq!(registry.flush_all(&host, &[], &[], &count), 0);
    }
}
