//! Canonical byte-key codec for snapshots.
//!
//! Layout: one varint `toc = 2 * n_nodes + b` where `b` flags immediate
//! entries, then `n_nodes` node-id varints, then (if `b`) a bitfield
//! varint selecting configured key attributes followed by one value
//! varint per set bit. The encoding is canonical so that semantically
//! identical snapshots produce byte-identical keys, and self-delimiting
//! so the trie can index it byte by byte.
//!
//! Everything on the encode side lives in fixed stack buffers; no heap
//! allocation happens regardless of signal context.

use std::sync::Arc;

use tracing::{error, warn};

use crate::db::varint;
use crate::error::{AggregateError, Result};
use crate::host::{AttrId, ContextNode, Host, NodeId, Snapshot, ATTR_INV, SNAP_MAX};

/// Maximum encoded key length in bytes.
pub const KEYLEN_MAX: usize = 128;

/// Maximum number of configured key attributes (bitfield width).
pub const MAX_KEY_ATTRS: usize = 64;

/// Maximum length of a synthesized key node path.
const MAX_PATH: usize = 128;

/// An encoded key in a fixed stack buffer.
#[derive(Clone, Copy)]
pub struct EncodedKey {
    bytes: [u8; KEYLEN_MAX],
    len: usize,
}

impl EncodedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for EncodedKey {
    fn default() -> Self {
        Self {
            bytes: [0; KEYLEN_MAX],
            len: 0,
        }
    }
}

/// Builds canonical keys for one database's snapshots.
pub struct KeyEncoder<'a> {
    /// Configured key attribute ids in declaration order. Unresolved
    /// slots hold `ATTR_INV` and still occupy their bitfield position.
    pub key_attrs: &'a [AttrId],
    /// Length cap for produced keys, at most `KEYLEN_MAX`.
    pub max_len: usize,
}

impl KeyEncoder<'_> {
    /// Encodes a snapshot into its canonical key.
    ///
    /// `aggr_root` anchors synthesized key node paths. `signal`
    /// suppresses diagnostics, which are not safe in signal context.
    pub fn encode(
        &self,
        host: &dyn Host,
        snapshot: &Snapshot,
        aggr_root: &Arc<ContextNode>,
        signal: bool,
    ) -> EncodedKey {
        let max_len = self.max_len.min(KEYLEN_MAX);

        // --- node portion ---

        let mut node_ids = [0u64; SNAP_MAX];
        let mut n_nodes = 0usize;

        // Compact the resolved key attribute ids for ancestor matching.
        let mut valid = [0u64; MAX_KEY_ATTRS];
        let mut n_valid = 0usize;
        for &id in self.key_attrs.iter().take(MAX_KEY_ATTRS) {
            if id != ATTR_INV {
                valid[n_valid] = id;
                n_valid += 1;
            }
        }

        if n_valid > 0 && !snapshot.nodes().is_empty() {
            n_nodes = match self.synthesize_key_node(
                host,
                snapshot,
                aggr_root,
                &valid[..n_valid],
                &mut node_ids,
                signal,
            ) {
                Ok(n) => n,
                Err(AggregateError::HostRejection) => {
                    // Proceed with an empty node portion; the toc still
                    // reflects the actual node count.
                    if !signal {
                        error!("aggregate: cannot synthesize key node, omitting node portion");
                    }
                    0
                }
                Err(_) => 0,
            };
        } else {
            // No usable key attributes: the nodes themselves are the
            // key. Sort ids so key equality is order-invariant.
            for node in snapshot.nodes().iter().take(SNAP_MAX) {
                node_ids[n_nodes] = node.id();
                n_nodes += 1;
            }
            node_ids[..n_nodes].sort_unstable();
        }

        // Encode node ids, stopping when the key budget would overflow.
        // The toc is re-measured per entry since its width depends on
        // the node count; one slack byte is kept in reserve.
        let mut node_key = [0u8; KEYLEN_MAX];
        let mut node_key_len = 0usize;
        let mut enc_nodes = 0u64;
        for &id in node_ids.iter().take(n_nodes) {
            let toc_after = varint::encoded_len(2 * (enc_nodes + 1) + 1);
            let need = varint::encoded_len(id);
            if toc_after + node_key_len + need + 1 > max_len {
                break;
            }
            node_key_len += varint::encode(id, &mut node_key[node_key_len..]);
            enc_nodes += 1;
        }

        // --- immediate portion ---

        let mut imm_key = [0u8; KEYLEN_MAX];
        let mut imm_key_len = 0usize;
        let mut bitfield = 0u64;

        'attrs: for (k, &attr) in self.key_attrs.iter().take(MAX_KEY_ATTRS).enumerate() {
            if attr == ATTR_INV {
                continue;
            }
            for (imm_attr, value) in snapshot.immediates() {
                if *imm_attr != attr {
                    continue;
                }
                let Some(bits) = value.to_bits() else {
                    continue;
                };
                let need = varint::encoded_len(bits);
                let toc_len = varint::encoded_len(2 * enc_nodes + 1);
                let bf_len = varint::encoded_len(bitfield | 1 << k);
                if toc_len + node_key_len + bf_len + imm_key_len + need + 1 > max_len {
                    // Out of room; later attributes cannot make it
                    // smaller, so stop scanning entirely.
                    break 'attrs;
                }
                imm_key_len += varint::encode(bits, &mut imm_key[imm_key_len..]);
                bitfield |= 1 << k;
                break;
            }
        }

        // --- assembly ---

        let mut key = EncodedKey::default();
        let toc = 2 * enc_nodes + u64::from(bitfield != 0);
        let mut pos = varint::encode(toc, &mut key.bytes);
        key.bytes[pos..pos + node_key_len].copy_from_slice(&node_key[..node_key_len]);
        pos += node_key_len;
        if bitfield != 0 {
            pos += varint::encode(bitfield, &mut key.bytes[pos..]);
            key.bytes[pos..pos + imm_key_len].copy_from_slice(&imm_key[..imm_key_len]);
            pos += imm_key_len;
        }
        key.len = pos;
        key
    }

    /// Collects the key-relevant ancestors of the snapshot's nodes and
    /// asks the host to fold them into a single key node. Returns the
    /// number of node ids written, which is zero when there is nothing
    /// to fold, or `HostRejection` when the host cannot build the path.
    fn synthesize_key_node(
        &self,
        host: &dyn Host,
        snapshot: &Snapshot,
        aggr_root: &Arc<ContextNode>,
        valid: &[AttrId],
        node_ids: &mut [u64; SNAP_MAX],
        signal: bool,
    ) -> Result<usize> {
        let snap_nodes = snapshot.nodes();
        let n_snap = snap_nodes.len().min(SNAP_MAX);

        // Count matches per key attribute over all ancestor chains and
        // remember where each chain first becomes relevant.
        let mut key_entries = [0usize; MAX_KEY_ATTRS];
        let mut start_nodes: [Option<&ContextNode>; SNAP_MAX] = [None; SNAP_MAX];

        for (i, snap_node) in snap_nodes.iter().take(n_snap).enumerate() {
            let mut cur = Some(&**snap_node);
            while let Some(node) = cur {
                for (a, &attr) in valid.iter().enumerate() {
                    if attr == node.attr() {
                        key_entries[a] += 1;
                        if start_nodes[i].is_none() {
                            start_nodes[i] = Some(node);
                        }
                    }
                }
                cur = node.parent().map(|p| &**p);
            }
        }

        // Prefix sum turns the counts into contiguous index ranges, one
        // per key attribute in declaration order.
        for a in 1..valid.len() {
            key_entries[a] += key_entries[a - 1];
        }

        let tot_entries = key_entries[valid.len() - 1];
        if tot_entries == 0 {
            return Ok(0);
        }
        if tot_entries > MAX_PATH {
            if !signal {
                warn!(
                    entries = tot_entries,
                    "aggregate: key node path too long, omitting node portion"
                );
            }
            return Ok(0);
        }

        // Second pass places each matched node at the end of its
        // attribute's range, deepest ancestor last.
        let mut filled = [0usize; MAX_KEY_ATTRS];
        let mut nodelist: [&ContextNode; MAX_PATH] = [&**aggr_root; MAX_PATH];

        for start in start_nodes.iter().take(n_snap) {
            let mut cur = *start;
            while let Some(node) = cur {
                for (a, &attr) in valid.iter().enumerate() {
                    if attr == node.attr() {
                        filled[a] += 1;
                        nodelist[key_entries[a] - filled[a]] = node;
                    }
                }
                cur = node.parent().map(|p| &**p);
            }
        }

        match host.make_tree_entry(&nodelist[..tot_entries], aggr_root) {
            Some(node) => {
                node_ids[0] = node.id();
                Ok(1)
            }
            None => Err(AggregateError::HostRejection),
        }
    }
}

/// A key decoded back into its constituents during flush.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodedKey {
    /// Context-tree node ids, in encoded order.
    pub node_ids: Vec<NodeId>,
    /// `(declaration index, raw value bits)` per packed immediate.
    pub immediates: Vec<(usize, u64)>,
}

/// Decodes a key produced by [`KeyEncoder::encode`].
///
/// `n_key_attrs` is the number of configured key attributes, which
/// bounds the bitfield positions that select immediate values.
pub fn decode(buf: &[u8], n_key_attrs: usize) -> Result<DecodedKey> {
    let mut pos = 0usize;

    let (toc, len) = decode_at(buf, pos)?;
    pos += len;
    let n_nodes = (toc / 2) as usize;
    let has_imm = toc & 1 == 1;

    let mut key = DecodedKey {
        node_ids: Vec::with_capacity(n_nodes.min(SNAP_MAX)),
        immediates: Vec::new(),
    };

    for _ in 0..n_nodes {
        let (id, len) = decode_at(buf, pos)?;
        pos += len;
        key.node_ids.push(id);
    }

    if has_imm {
        let (bitfield, len) = decode_at(buf, pos)?;
        pos += len;
        for k in 0..n_key_attrs.min(MAX_KEY_ATTRS) {
            if bitfield & (1 << k) != 0 {
                let (bits, len) = decode_at(buf, pos)?;
                pos += len;
                key.immediates.push((k, bits));
            }
        }
    }

    Ok(key)
}

fn decode_at(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    if pos >= buf.len() {
        return Err(AggregateError::Decode {
            offset: pos,
            reason: "key ends mid-record",
        });
    }
    varint::decode(&buf[pos..]).map_err(|err| match err {
        AggregateError::Decode { offset, reason } => AggregateError::Decode {
            offset: pos + offset,
            reason,
        },
        other => other,
    })
}
