//! In-memory host framework used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use snapfold::host::{
    AttrId, AttrType, Attribute, ContextNode, Host, NodeId, Snapshot, Value,
};

/// Minimal host: an attribute registry, a node table, path synthesis
/// with stable ids, a signal-context switch, and an emission capture.
#[derive(Default)]
pub struct MockHost {
    attrs: Mutex<HashMap<String, Attribute>>,
    next_attr_id: AtomicU64,
    nodes: Mutex<HashMap<NodeId, Arc<ContextNode>>>,
    paths: Mutex<HashMap<Vec<(AttrId, String)>, Arc<ContextNode>>>,
    next_node_id: AtomicU64,
    signal: AtomicBool,
    emitted: Mutex<Vec<Snapshot>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            next_node_id: AtomicU64::new(1_000_000),
            ..Self::default()
        }
    }

    pub fn set_signal(&self, v: bool) {
        self.signal.store(v, Ordering::SeqCst);
    }

    /// Registers a context node under a caller-chosen id.
    pub fn add_node(
        &self,
        id: NodeId,
        attr: AttrId,
        value: Value,
        parent: Option<Arc<ContextNode>>,
    ) -> Arc<ContextNode> {
        let node = Arc::new(ContextNode::new(id, attr, value, parent));
        self.nodes.lock().insert(id, node.clone());
        node
    }

    /// Drains the snapshots captured since the last call.
    pub fn take_emitted(&self) -> Vec<Snapshot> {
        std::mem::take(&mut *self.emitted.lock())
    }
}

impl Host for MockHost {
    fn get_attribute(&self, name: &str) -> Option<Attribute> {
        self.attrs.lock().get(name).cloned()
    }

    fn create_attribute(&self, name: &str, ty: AttrType, _flags: u32) -> Attribute {
        let mut attrs = self.attrs.lock();
        if let Some(attr) = attrs.get(name) {
            return attr.clone();
        }
        let id = self.next_attr_id.fetch_add(1, Ordering::SeqCst);
        let attr = Attribute::new(id, name, ty);
        attrs.insert(name.to_string(), attr.clone());
        attr
    }

    fn make_tree_entry(
        &self,
        path: &[&ContextNode],
        root: &Arc<ContextNode>,
    ) -> Option<Arc<ContextNode>> {
        if path.is_empty() {
            return None;
        }
        let signature: Vec<(AttrId, String)> = path
            .iter()
            .map(|n| (n.attr(), format!("{:?}", n.value())))
            .collect();
        let mut paths = self.paths.lock();
        if let Some(node) = paths.get(&signature) {
            return Some(node.clone());
        }
        let last = path[path.len() - 1];
        let id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(ContextNode::new(
            id,
            last.attr(),
            last.value().clone(),
            Some(root.clone()),
        ));
        self.nodes.lock().insert(id, node.clone());
        paths.insert(signature, node.clone());
        Some(node)
    }

    fn node(&self, id: NodeId) -> Option<Arc<ContextNode>> {
        self.nodes.lock().get(&id).cloned()
    }

    fn is_signal_context(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    fn emit_reduced_snapshot(&self, snapshot: &Snapshot) {
        self.emitted.lock().push(snapshot.clone());
    }
}

/// Finds an immediate value in an emitted snapshot by attribute id.
pub fn imm_value(snap: &Snapshot, attr: AttrId) -> Option<Value> {
    snap.immediates()
        .iter()
        .find(|(a, _)| *a == attr)
        .map(|(_, v)| v.clone())
}
