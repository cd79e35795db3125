//! Per-thread aggregation database and its building blocks.
//!
//! Each application thread owns one [`AggregateDb`]. Ingest folds
//! snapshots into trie-indexed statistic kernels; flush walks the trie
//! and re-emits reduced synthetic snapshots through the host.

pub mod block;
pub mod kernel;
pub mod key;
pub mod trie;
pub mod varint;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::host::{AttrId, Attribute, ContextNode, Host, Snapshot, Value, SNAP_MAX};

use self::kernel::KernelPool;
use self::key::{EncodedKey, KeyEncoder, KEYLEN_MAX};
use self::trie::{ByteTrie, TrieNode, NO_KERNELS};

/// Statistics attributes derived for one aggregated attribute.
#[derive(Debug, Clone)]
pub struct StatsAttributes {
    pub min: Attribute,
    pub max: Attribute,
    pub sum: Attribute,
}

/// How the database disposed of one ingested snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The snapshot was folded into its key's statistics.
    Absorbed,
    /// The snapshot carried nothing to aggregate.
    Ignored,
    /// The snapshot was dropped (stopped database or capacity miss).
    Dropped,
}

/// Point-in-time database statistics, folded into the registry's global
/// counters at flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub trie_entries: usize,
    pub kernel_entries: usize,
    pub trie_blocks: usize,
    pub kernel_blocks: usize,
    pub dropped: usize,
    pub max_keylen: usize,
}

/// Mutable database state. Owned by the ingesting thread; the flusher
/// borrows it only while the owner observes the stopped flag.
struct DbCore {
    aggr_attrs: Vec<Option<Attribute>>,
    trie: ByteTrie,
    kernels: KernelPool,
    num_dropped: usize,
    max_keylen: usize,
}

/// One thread's aggregation database.
pub struct AggregateDb {
    stopped: AtomicBool,
    retired: AtomicBool,
    /// Anchor for key node paths synthesized on this database's behalf.
    aggr_root: Arc<ContextNode>,
    core: Mutex<DbCore>,
}

impl AggregateDb {
    /// Creates a database, resolving the configured aggregated
    /// attributes and pre-installing the first trie and kernel blocks
    /// so early signal-context ingests find them ready.
    pub fn new(host: &dyn Host, aggr_attr_names: &[String]) -> Self {
        debug!("aggregate: creating per-thread aggregation database");

        let aggr_attrs = aggr_attr_names
            .iter()
            .map(|name| {
                let attr = host.get_attribute(name);
                if attr.is_none() {
                    warn!(attribute = %name, "aggregate: aggregation attribute not found");
                }
                attr
            })
            .collect();

        let mut trie = ByteTrie::new();
        let mut kernels = KernelPool::new();
        trie.prime();
        kernels.prime();

        Self {
            stopped: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            aggr_root: Arc::new(ContextNode::detached()),
            core: Mutex::new(DbCore {
                aggr_attrs,
                trie,
                kernels,
                num_dropped: 0,
                max_keylen: 0,
            }),
        }
    }

    /// Ingest hot path. Never blocks and never allocates when `signal`
    /// is set; misses are counted as drops instead.
    pub fn process(
        &self,
        host: &dyn Host,
        snapshot: &Snapshot,
        key_attrs: &[AttrId],
        signal: bool,
    ) -> ProcessOutcome {
        if self.stopped.load(Ordering::Acquire) {
            return ProcessOutcome::Dropped;
        }
        if snapshot.is_empty() {
            return ProcessOutcome::Ignored;
        }

        let encoder = KeyEncoder {
            key_attrs,
            max_len: KEYLEN_MAX,
        };
        let key = encoder.encode(host, snapshot, &self.aggr_root, signal);
        if key.is_empty() {
            return ProcessOutcome::Ignored;
        }

        // A held lock means the flusher owns the core right now; the
        // ingest path must not wait for it.
        let Some(mut guard) = self.core.try_lock() else {
            return ProcessOutcome::Dropped;
        };
        self.absorb(&mut guard, snapshot, &key, !signal)
    }

    fn absorb(
        &self,
        core: &mut DbCore,
        snapshot: &Snapshot,
        key: &EncodedKey,
        alloc: bool,
    ) -> ProcessOutcome {
        core.max_keylen = core.max_keylen.max(key.len());

        let n_aggr = core.aggr_attrs.len();
        let k_id = match core
            .trie
            .find_or_create(key.as_bytes(), alloc, &mut core.kernels, n_aggr)
        {
            Some(entry) => {
                entry.count += 1;
                entry.k_id
            }
            None => {
                core.num_dropped += 1;
                return ProcessOutcome::Dropped;
            }
        };

        if k_id != NO_KERNELS {
            for (a, attr) in core.aggr_attrs.iter().enumerate() {
                let Some(attr) = attr else { continue };
                for (imm_attr, value) in snapshot.immediates() {
                    if *imm_attr != attr.id() {
                        continue;
                    }
                    let Some(val) = value.as_f64() else { continue };
                    if let Some(kernel) = core.kernels.get_mut(k_id + a as u32, alloc) {
                        kernel.add(val);
                    }
                }
            }
        }

        ProcessOutcome::Absorbed
    }

    /// Walks the trie and emits one reduced snapshot per populated key.
    ///
    /// Returns the number of records emitted. A decode failure aborts
    /// this database's flush; keys are self-produced, so it indicates
    /// corruption.
    pub fn flush(
        &self,
        host: &dyn Host,
        key_attrs: &[Option<Attribute>],
        stats_attrs: &[StatsAttributes],
        count_attr: &Attribute,
    ) -> Result<usize> {
        let core = self.core.lock();
        let mut emitted = 0usize;
        let mut failure = None;

        core.trie.walk(|key, entry| {
            if failure.is_some() {
                return;
            }
            match emit_reduced(&core, host, key, entry, key_attrs, stats_attrs, count_attr) {
                Ok(()) => emitted += 1,
                Err(err) => failure = Some(err),
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(emitted),
        }
    }

    /// Drops all trie and kernel blocks and resets the counters.
    pub fn clear(&self) {
        let mut core = self.core.lock();
        core.trie.clear();
        core.kernels.clear();
        core.num_dropped = 0;
        core.max_keylen = 0;
    }

    pub fn stats(&self) -> DbStats {
        let core = self.core.lock();
        DbStats {
            trie_entries: core.trie.num_entries(),
            kernel_entries: core.kernels.num_entries(),
            trie_blocks: core.trie.num_blocks(),
            kernel_blocks: core.kernels.num_blocks(),
            dropped: core.num_dropped,
            max_keylen: core.max_keylen,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_stopped(&self, v: bool) {
        self.stopped.store(v, Ordering::Release);
    }

    pub fn retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn set_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// Decodes one trie terminal back into a synthetic snapshot and hands
/// it to the host.
fn emit_reduced(
    core: &DbCore,
    host: &dyn Host,
    key_bytes: &[u8],
    entry: &TrieNode,
    key_attrs: &[Option<Attribute>],
    stats_attrs: &[StatsAttributes],
    count_attr: &Attribute,
) -> Result<()> {
    let decoded = key::decode(key_bytes, key_attrs.len())?;
    let mut snap = Snapshot::new();

    for id in decoded.node_ids.iter().take(SNAP_MAX) {
        match host.node(*id) {
            Some(node) => snap.push_node(node),
            None => {
                return Err(crate::error::AggregateError::Decode {
                    offset: 0,
                    reason: "key references unknown node id",
                })
            }
        }
    }

    for (k, bits) in &decoded.immediates {
        if let Some(attr) = key_attrs.get(*k).and_then(|a| a.as_ref()) {
            snap.push_immediate(attr.id(), Value::from_bits(attr.ty(), *bits));
        }
    }

    if entry.k_id != NO_KERNELS {
        for (a, stats) in stats_attrs.iter().enumerate().take(SNAP_MAX / 3) {
            let Some(kernel) = core.kernels.get(entry.k_id + a as u32) else {
                break;
            };
            if kernel.count == 0 {
                continue;
            }
            snap.push_immediate(stats.min.id(), Value::Double(kernel.min));
            snap.push_immediate(stats.max.id(), Value::Double(kernel.max));
            snap.push_immediate(stats.sum.id(), Value::Double(kernel.sum));
        }
    }

    snap.push_immediate(count_attr.id(), Value::Uint(u64::from(entry.count)));
    host.emit_reduced_snapshot(&snap);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::TestHost;
    use crate::host::AttrType;

    fn setup(host: &TestHost) -> (AggregateDb, Vec<StatsAttributes>, Attribute) {
        host.create_attribute("t", AttrType::Double, 0);
        let stats = vec![StatsAttributes {
            min: host.create_attribute("min#t", AttrType::Double, 0),
            max: host.create_attribute("max#t", AttrType::Double, 0),
            sum: host.create_attribute("sum#t", AttrType::Double, 0),
        }];
        let count = host.create_attribute("count", AttrType::Uint, 0);
        let db = AggregateDb::new(host, &["t".to_string()]);
        (db, stats, count)
    }

    fn imm_value(snap: &Snapshot, attr: AttrId) -> Option<Value> {
        snap.immediates()
            .iter()
            .find(|(a, _)| *a == attr)
            .map(|(_, v)| v.clone())
    }

    #[test]
    fn test_process_folds_equal_keys_into_one_terminal() {
        let host = TestHost::new();
        let (db, stats, count) = setup(&host);
        let t = host.get_attribute("t").unwrap();
        let node = host.add_node(7, 1, Value::Uint(7), None);

        for v in [10.0, 30.0, 20.0] {
            let mut snap = Snapshot::new();
            snap.push_node(node.clone());
            snap.push_immediate(t.id(), Value::Double(v));
            assert_eq!(
                db.process(&host, &snap, &[], false),
                ProcessOutcome::Absorbed
            );
        }

        let emitted = db.flush(&host, &[], &stats, &count).expect("flush");
        assert_eq!(emitted, 1);

        let records = host.emitted.lock();
        let rec = &records[0];
        assert_eq!(rec.nodes().len(), 1);
        assert_eq!(rec.nodes()[0].id(), 7);
        assert_eq!(imm_value(rec, stats[0].min.id()), Some(Value::Double(10.0)));
        assert_eq!(imm_value(rec, stats[0].max.id()), Some(Value::Double(30.0)));
        assert_eq!(imm_value(rec, stats[0].sum.id()), Some(Value::Double(60.0)));
        assert_eq!(imm_value(rec, count.id()), Some(Value::Uint(3)));
    }

    #[test]
    fn test_stopped_database_drops() {
        let host = TestHost::new();
        let (db, _, _) = setup(&host);
        let t = host.get_attribute("t").unwrap();

        db.set_stopped(true);
        let mut snap = Snapshot::new();
        snap.push_immediate(t.id(), Value::Double(1.0));
        assert_eq!(
            db.process(&host, &snap, &[], false),
            ProcessOutcome::Dropped
        );

        db.set_stopped(false);
        assert_eq!(
            db.process(&host, &snap, &[], false),
            ProcessOutcome::Absorbed
        );
    }

    #[test]
    fn test_empty_snapshot_is_ignored() {
        let host = TestHost::new();
        let (db, _, _) = setup(&host);
        assert_eq!(
            db.process(&host, &Snapshot::new(), &[], false),
            ProcessOutcome::Ignored
        );
        assert_eq!(db.stats().dropped, 0);
    }

    #[test]
    fn test_signal_context_fresh_key_drops_without_allocation() {
        let host = TestHost::new();
        let (db, _, _) = setup(&host);
        let t = host.get_attribute("t").unwrap();
        let node = host.add_node(900, 1, Value::Uint(900), None);

        let before = db.stats();

        let mut snap = Snapshot::new();
        snap.push_node(node);
        snap.push_immediate(t.id(), Value::Double(1.0));
        assert_eq!(db.process(&host, &snap, &[], true), ProcessOutcome::Dropped);

        let after = db.stats();
        assert_eq!(after.trie_blocks, before.trie_blocks);
        assert_eq!(after.kernel_blocks, before.kernel_blocks);
        assert_eq!(after.dropped, before.dropped + 1);
    }

    #[test]
    fn test_signal_context_warm_key_is_absorbed() {
        let host = TestHost::new();
        let (db, stats, count) = setup(&host);
        let t = host.get_attribute("t").unwrap();
        let node = host.add_node(7, 1, Value::Uint(7), None);

        let mut snap = Snapshot::new();
        snap.push_node(node);
        snap.push_immediate(t.id(), Value::Double(2.0));

        // First ingest installs the path, second runs in signal context.
        assert_eq!(
            db.process(&host, &snap, &[], false),
            ProcessOutcome::Absorbed
        );
        let blocks = db.stats();
        assert_eq!(db.process(&host, &snap, &[], true), ProcessOutcome::Absorbed);
        let after = db.stats();
        assert_eq!(after.trie_blocks, blocks.trie_blocks);
        assert_eq!(after.kernel_blocks, blocks.kernel_blocks);

        let emitted = db.flush(&host, &[], &stats, &count).expect("flush");
        assert_eq!(emitted, 1);
        let records = host.emitted.lock();
        assert_eq!(
            imm_value(&records[0], count.id()),
            Some(Value::Uint(2))
        );
    }

    #[test]
    fn test_no_aggregated_attributes_still_counts() {
        let host = TestHost::new();
        let count = host.create_attribute("count", AttrType::Uint, 0);
        let db = AggregateDb::new(&host, &[]);
        let node = host.add_node(3, 1, Value::Uint(3), None);

        let mut snap = Snapshot::new();
        snap.push_node(node);
        db.process(&host, &snap, &[], false);
        db.process(&host, &snap, &[], false);

        assert_eq!(db.stats().kernel_entries, 0);

        let emitted = db.flush(&host, &[], &[], &count).expect("flush");
        assert_eq!(emitted, 1);
        let records = host.emitted.lock();
        assert_eq!(imm_value(&records[0], count.id()), Some(Value::Uint(2)));
        // Only the count is present, no statistics entries.
        assert_eq!(records[0].immediates().len(), 1);
    }

    #[test]
    fn test_clear_empties_database() {
        let host = TestHost::new();
        let (db, stats, count) = setup(&host);
        let t = host.get_attribute("t").unwrap();

        let mut snap = Snapshot::new();
        snap.push_immediate(t.id(), Value::Double(5.0));
        db.process(&host, &snap, &[], false);
        db.clear();

        assert_eq!(db.stats().trie_entries, 0);
        assert_eq!(db.flush(&host, &[], &stats, &count).expect("flush"), 0);
    }

    #[test]
    fn test_unknown_aggregated_attribute_is_skipped() {
        let host = TestHost::new();
        let count = host.create_attribute("count", AttrType::Uint, 0);
        // "missing" was never registered with the host.
        let db = AggregateDb::new(&host, &["missing".to_string()]);

        let mut snap = Snapshot::new();
        snap.push_immediate(999, Value::Double(1.0));
        assert_eq!(
            db.process(&host, &snap, &[], false),
            ProcessOutcome::Absorbed
        );
        assert_eq!(db.flush(&host, &[], &[], &count).expect("flush"), 1);
    }
}
