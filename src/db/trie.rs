//! 256-way byte trie over the block allocator.
//!
//! Nodes reference children by 32-bit id rather than by pointer, so the
//! structure is a flat arena plus indices and clearing the allocator
//! frees everything at once. The root always has id 0; child ids are
//! handed out sequentially on first insert.

use crate::db::block::BlockAlloc;
use crate::db::kernel::KernelPool;

/// Kernel-run sentinel: no kernel slots assigned to this terminal yet.
pub const NO_KERNELS: u32 = u32::MAX;

/// One trie node: child table, kernel run base, and snapshot count.
pub struct TrieNode {
    /// Child node ids per key byte. 0 means no child.
    pub next: [u32; 256],
    /// First id of this terminal's run of kernel slots.
    pub k_id: u32,
    /// Number of snapshots absorbed at exactly this key.
    pub count: u32,
}

impl Default for TrieNode {
    fn default() -> Self {
        Self {
            next: [0; 256],
            k_id: NO_KERNELS,
            count: 0,
        }
    }
}

/// Byte trie mapping encoded keys to terminal statistic entries.
#[derive(Default)]
pub struct ByteTrie {
    nodes: BlockAlloc<TrieNode>,
    num_entries: usize,
}

impl ByteTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-installs the root block so early signal-context ingests can
    /// traverse without allocating.
    pub fn prime(&mut self) {
        let _ = self.nodes.get_mut(0, true);
    }

    /// Walks `key` from the root, creating missing edges when `alloc` is
    /// set, and returns the terminal entry with its kernel run assigned.
    ///
    /// With `alloc` false any missing edge, missing block, or
    /// unassignable kernel run yields `None` and the caller drops the
    /// sample. `n_kernels` is the number of configured aggregated
    /// attributes; when it is zero terminals keep the `NO_KERNELS`
    /// sentinel.
    pub fn find_or_create(
        &mut self,
        key: &[u8],
        alloc: bool,
        kernels: &mut KernelPool,
        n_kernels: usize,
    ) -> Option<&mut TrieNode> {
        let mut cur = 0u32;

        // Root existence check doubles as the first-block installation.
        match self.nodes.get_mut(cur, alloc) {
            Ok(Some(_)) => {}
            _ => return None,
        }

        for &byte in key {
            let next = match self.nodes.get_mut(cur, alloc) {
                Ok(Some(node)) => node.next[byte as usize],
                _ => return None,
            };

            cur = if next != 0 {
                next
            } else {
                if !alloc {
                    return None;
                }
                self.num_entries += 1;
                let id = self.num_entries as u32;
                match self.nodes.get_mut(cur, alloc) {
                    Ok(Some(node)) => node.next[byte as usize] = id,
                    _ => return None,
                }
                id
            };
        }

        let needs_kernels = match self.nodes.get_mut(cur, alloc) {
            Ok(Some(node)) => node.k_id == NO_KERNELS && n_kernels > 0,
            _ => return None,
        };
        if needs_kernels {
            let first = kernels.alloc_run(n_kernels, alloc)?;
            if let Ok(Some(node)) = self.nodes.get_mut(cur, alloc) {
                node.k_id = first;
            }
        }

        match self.nodes.get_mut(cur, alloc) {
            Ok(entry) => entry,
            Err(_) => None,
        }
    }

    /// Read-only lookup of a terminal entry. Never allocates.
    pub fn find(&self, key: &[u8]) -> Option<&TrieNode> {
        let mut node = self.nodes.get(0)?;
        for &byte in key {
            let next = node.next[byte as usize];
            if next == 0 {
                return None;
            }
            node = self.nodes.get(next)?;
        }
        Some(node)
    }

    /// Depth-first pre-order walk over every reachable node with a
    /// non-zero count, passing the reconstructed key bytes.
    ///
    /// Recursion depth is bounded by the maximum key length.
    pub fn walk<F: FnMut(&[u8], &TrieNode)>(&self, mut visit: F) {
        let Some(root) = self.nodes.get(0) else {
            return;
        };
        let mut key = Vec::new();
        self.walk_node(root, &mut key, &mut visit);
    }

    fn walk_node<F: FnMut(&[u8], &TrieNode)>(
        &self,
        node: &TrieNode,
        key: &mut Vec<u8>,
        visit: &mut F,
    ) {
        if node.count > 0 {
            visit(key, node);
        }

        for byte in 0..=255u8 {
            let id = node.next[byte as usize];
            if id == 0 {
                continue;
            }
            // An edge can dangle if the child's block allocation failed.
            let Some(child) = self.nodes.get(id) else {
                continue;
            };
            key.push(byte);
            self.walk_node(child, key, visit);
            key.pop();
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.num_entries = 0;
    }

    /// Number of non-root entries handed out.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn num_blocks(&self) -> usize {
        self.nodes.num_blocks()
    }
}
