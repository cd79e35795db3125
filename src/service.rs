//! Service shell wiring the aggregation core to host framework events.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AggregateConfig;
use crate::db::block::ENTRIES_PER_BLOCK;
use crate::db::kernel::StatKernel;
use crate::db::key::MAX_KEY_ATTRS;
use crate::db::trie::TrieNode;
use crate::db::{ProcessOutcome, StatsAttributes};
use crate::host::{
    AttrType, Attribute, Host, Service, Snapshot, ATTR_AS_VALUE, ATTR_INV, ATTR_SCOPE_THREAD,
};
use crate::registry::Registry;

/// Service name tag used at registration.
pub const SERVICE_NAME: &str = "aggregate";

/// The on-line aggregation service.
///
/// Create with [`AggregateService::register`] and hand the instance to
/// the host's event dispatch as a [`Service`].
pub struct AggregateService {
    key_attr_names: Vec<String>,
    /// Resolved key attribute ids, refreshed without locking so the
    /// ingest path can read them from signal context.
    key_ids: Vec<AtomicU64>,
    /// Full key attribute handles, needed for value types at flush.
    key_handles: Mutex<Vec<Option<Attribute>>>,
    stats_attrs: Vec<StatsAttributes>,
    count_attr: Attribute,
    registry: Registry,
}

impl AggregateService {
    /// Reads the configuration, creates the statistics attributes with
    /// the host, and returns the service ready for event subscription.
    pub fn register(host: &dyn Host, cfg: &AggregateConfig) -> Result<Self> {
        cfg.validate()?;

        let aggr_attr_names = cfg.aggregated_attribute_names();
        let key_attr_names = cfg.key_attribute_names();

        let flags = ATTR_AS_VALUE | ATTR_SCOPE_THREAD;
        let stats_attrs = aggr_attr_names
            .iter()
            .map(|name| StatsAttributes {
                min: host.create_attribute(&format!("min#{name}"), AttrType::Double, flags),
                max: host.create_attribute(&format!("max#{name}"), AttrType::Double, flags),
                sum: host.create_attribute(&format!("sum#{name}"), AttrType::Double, flags),
            })
            .collect();
        let count_attr = host.create_attribute("count", AttrType::Uint, flags);

        let key_ids = key_attr_names
            .iter()
            .map(|_| AtomicU64::new(ATTR_INV))
            .collect();
        let key_handles = Mutex::new(vec![None; key_attr_names.len()]);

        info!(service = SERVICE_NAME, "registered aggregation service");

        Ok(Self {
            key_attr_names,
            key_ids,
            key_handles,
            stats_attrs,
            count_attr,
            registry: Registry::new(aggr_attr_names),
        })
    }

    /// The database registry, exposed for diagnostics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn update_key_attribute(&self, index: usize, attr: &Attribute) {
        self.key_handles.lock()[index] = Some(attr.clone());
        self.key_ids[index].store(attr.id(), Ordering::Relaxed);
    }
}

impl Service for AggregateService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn attribute_created(&self, _host: &dyn Host, attr: &Attribute) {
        if let Some(index) = self
            .key_attr_names
            .iter()
            .position(|name| name == attr.name())
        {
            self.update_key_attribute(index, attr);
        }
    }

    fn post_init(&self, host: &dyn Host) {
        // Resolve key attributes that existed before registration.
        for (index, name) in self.key_attr_names.iter().enumerate() {
            if let Some(attr) = host.get_attribute(name) {
                self.update_key_attribute(index, &attr);
            }
        }

        // Eagerly create the primary thread's database.
        self.registry.acquire(host, true);
    }

    fn process_snapshot(&self, host: &dyn Host, snapshot: &Snapshot) {
        let signal = host.is_signal_context();

        let mut key_attrs = [ATTR_INV; MAX_KEY_ATTRS];
        let n_keys = self.key_ids.len().min(MAX_KEY_ATTRS);
        for (slot, id) in key_attrs.iter_mut().zip(self.key_ids.iter()) {
            *slot = id.load(Ordering::Relaxed);
        }

        match self.registry.acquire(host, !signal) {
            Some(db) if !db.stopped() => {
                if db.process(host, snapshot, &key_attrs[..n_keys], signal)
                    == ProcessOutcome::Dropped
                {
                    self.registry.stats().add_dropped(1);
                }
            }
            _ => self.registry.stats().add_dropped(1),
        }
    }

    fn flush(&self, host: &dyn Host) {
        let key_attrs = self.key_handles.lock().clone();
        self.registry
            .flush_all(host, &key_attrs, &self.stats_attrs, &self.count_attr);
    }

    fn finish(&self, _host: &dyn Host) {
        let stats = self.registry.stats().snapshot();

        let reserved_bytes = (stats.trie_blocks * mem::size_of::<TrieNode>()
            + stats.kernel_blocks * mem::size_of::<StatKernel>())
            * ENTRIES_PER_BLOCK;
        debug!(
            max_keylen = stats.max_keylen,
            kernel_entries = stats.kernel_entries,
            trie_entries = stats.trie_entries,
            blocks = stats.trie_blocks + stats.kernel_blocks,
            reserved_bytes,
            "aggregate: final statistics"
        );

        // Report configured key attributes that never showed up.
        for (index, name) in self.key_attr_names.iter().enumerate() {
            if self.key_ids[index].load(Ordering::Relaxed) == ATTR_INV {
                warn!(
                    attribute = %name,
                    "aggregate: key attribute was never encountered"
                );
            }
        }

        if stats.dropped > 0 {
            info!(dropped = stats.dropped, "aggregate: dropped snapshots");
        }
    }
}
