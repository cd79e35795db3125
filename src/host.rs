//! Contracts consumed from the host measurement framework.
//!
//! The aggregation service does not own attribute registration, context
//! trees, or snapshot delivery. The host implements [`Host`]; the service
//! implements [`Service`] and is driven entirely through its callbacks.

use std::fmt;
use std::sync::Arc;

/// Stable numeric id of an attribute, assigned by the host.
pub type AttrId = u64;

/// Stable numeric id of a context-tree node, assigned by the host.
pub type NodeId = u64;

/// Sentinel for an unresolved attribute id.
pub const ATTR_INV: AttrId = u64::MAX;

/// Sentinel id of detached anchor nodes that are not in the host tree.
pub const NODE_INV: NodeId = u64::MAX;

/// Maximum number of entries emitted into a synthetic snapshot.
pub const SNAP_MAX: usize = 80;

/// Attribute stores its value directly in snapshots instead of the tree.
pub const ATTR_AS_VALUE: u32 = 1;

/// Attribute values are scoped to the producing thread.
pub const ATTR_SCOPE_THREAD: u32 = 2;

/// Value type of a measurement attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    String,
    Address,
    Int,
    Uint,
    Bool,
    Double,
    /// Type tag for framework tree nodes.
    Node,
}

impl AttrType {
    /// Returns the canonical type name used in diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Address => "addr",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Bool => "bool",
            Self::Double => "double",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed immediate value carried in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Arc<str>),
    Addr(u64),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Double(f64),
}

impl Value {
    /// Reinterprets the value as raw 64-bit key material.
    ///
    /// Strings have no stable 64-bit form and are not packable into keys.
    pub fn to_bits(&self) -> Option<u64> {
        match self {
            Self::Str(_) => None,
            Self::Addr(v) => Some(*v),
            Self::Int(v) => Some(*v as u64),
            Self::Uint(v) => Some(*v),
            Self::Bool(v) => Some(u64::from(*v)),
            Self::Double(v) => Some(v.to_bits()),
        }
    }

    /// Rebuilds a value of the given type from raw key material.
    pub fn from_bits(ty: AttrType, bits: u64) -> Self {
        match ty {
            AttrType::Address => Self::Addr(bits),
            AttrType::Int => Self::Int(bits as i64),
            AttrType::Bool => Self::Bool(bits != 0),
            AttrType::Double => Self::Double(f64::from_bits(bits)),
            // Non-numeric types round-trip as raw bits.
            AttrType::Uint | AttrType::String | AttrType::Node => Self::Uint(bits),
        }
    }

    /// Converts numeric values to a double for statistic accumulation.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Str(_) => None,
            Self::Addr(v) => Some(*v as f64),
            Self::Int(v) => Some(*v as f64),
            Self::Uint(v) => Some(*v as f64),
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            Self::Double(v) => Some(*v),
        }
    }
}

/// Handle to a host-registered attribute.
#[derive(Debug, Clone)]
pub struct Attribute {
    id: AttrId,
    name: Arc<str>,
    ty: AttrType,
}

impl Attribute {
    /// Creates an attribute handle. Normally done by the host.
    pub fn new(id: AttrId, name: impl Into<Arc<str>>, ty: AttrType) -> Self {
        Self {
            id,
            name: name.into(),
            ty,
        }
    }

    pub fn id(&self) -> AttrId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> AttrType {
        self.ty
    }
}

/// An immutable node in the host's context tree.
///
/// Nodes form a rooted DAG of annotation values. They never change once
/// created, so parent links are shared `Arc`s and ancestor walks require
/// no host calls.
#[derive(Debug)]
pub struct ContextNode {
    id: NodeId,
    attr: AttrId,
    value: Value,
    parent: Option<Arc<ContextNode>>,
}

impl ContextNode {
    /// Creates a node handle. Normally done by the host.
    pub fn new(id: NodeId, attr: AttrId, value: Value, parent: Option<Arc<ContextNode>>) -> Self {
        Self {
            id,
            attr,
            value,
            parent,
        }
    }

    /// Creates the blank anchor node a database uses as the root for
    /// synthesized key node paths. Not part of the host tree.
    pub fn detached() -> Self {
        Self {
            id: NODE_INV,
            attr: ATTR_INV,
            value: Value::Uint(0),
            parent: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn attr(&self) -> AttrId {
        self.attr
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn parent(&self) -> Option<&Arc<ContextNode>> {
        self.parent.as_ref()
    }
}

/// One measurement event: context-tree nodes plus immediate values.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<Arc<ContextNode>>,
    immediates: Vec<(AttrId, Value)>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_node(&mut self, node: Arc<ContextNode>) {
        self.nodes.push(node);
    }

    pub fn push_immediate(&mut self, attr: AttrId, value: Value) {
        self.immediates.push((attr, value));
    }

    pub fn nodes(&self) -> &[Arc<ContextNode>] {
        &self.nodes
    }

    pub fn immediates(&self) -> &[(AttrId, Value)] {
        &self.immediates
    }

    /// Whether the snapshot carries no entries at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.immediates.is_empty()
    }
}

/// The host framework as seen by the aggregation service.
///
/// Methods invoked from the ingest path (`make_tree_entry`,
/// `is_signal_context`) must be safe to call from signal context; the
/// host certifies this as part of its contract.
pub trait Host {
    /// Looks up an attribute by name.
    fn get_attribute(&self, name: &str) -> Option<Attribute>;

    /// Creates (or returns the existing) attribute with the given name.
    fn create_attribute(&self, name: &str, ty: AttrType, flags: u32) -> Attribute;

    /// Synthesizes a single node representing `path` rooted at `root`,
    /// returning a node with a stable id. May fail.
    fn make_tree_entry(
        &self,
        path: &[&ContextNode],
        root: &Arc<ContextNode>,
    ) -> Option<Arc<ContextNode>>;

    /// Resolves a node id back to its handle.
    fn node(&self, id: NodeId) -> Option<Arc<ContextNode>>;

    /// Whether the current call stack runs inside a signal handler.
    fn is_signal_context(&self) -> bool;

    /// Accepts a reduced synthetic snapshot produced during flush.
    fn emit_reduced_snapshot(&self, snapshot: &Snapshot);
}

/// Event subscriptions a runtime service registers with the host.
pub trait Service {
    /// Service name tag used in registration and diagnostics.
    fn name(&self) -> &'static str;

    /// A new attribute became known to the host.
    fn attribute_created(&self, host: &dyn Host, attr: &Attribute);

    /// The host finished initialization on the primary thread.
    fn post_init(&self, host: &dyn Host);

    /// A measurement snapshot arrived on the current thread.
    fn process_snapshot(&self, host: &dyn Host, snapshot: &Snapshot);

    /// The host requests all buffered data to be written out.
    fn flush(&self, host: &dyn Host);

    /// The host is shutting down; emit summary diagnostics.
    fn finish(&self, host: &dyn Host);
}
