//! Content-addressed prefix tree over page hashes, enabling KV-cache reuse
//! across requests that share a prompt prefix.
//!
//! Grounded on `utils/kvcache/prefixtree.py` (`Node.split`/`add`/
//! `treematch`/`free`, `PrefixTree.match`/`add`/`modify`/`free`).
//! Reimplemented as an arena of nodes addressed by `NodeId` rather than the
//! original's parent/child object references, since those form reference
//! cycles a Rust tree would otherwise need `Rc<RefCell<_>>` for.
//!
//! Node timestamps are a logical clock rather than wall time: every touch
//! bumps a single monotonic counter, which is what the LRU ordering in
//! `free` actually needs and is deterministic to test.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::pagetable::PageId;

pub type NodeId = usize;

/// The result of matching a token sequence's page hashes against the tree:
/// how many pages (not tokens) matched, and the node the match ended at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub matched_len: usize,
    pub node: NodeId,
}

struct Node {
    page_indices: Vec<PageId>,
    page_hashes: Vec<u64>,
    parent: Option<NodeId>,
    children: BTreeSet<NodeId>,
    subtree_size: usize,
    timestamp: u64,
    is_root: bool,
}

struct Inner {
    arena: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    root: NodeId,
    clock: u64,
}

impl Inner {
    fn node(&self, id: NodeId) -> &Node {
        self.arena[id].as_ref().expect("dangling NodeId")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena[id].as_mut().expect("dangling NodeId")
    }

    fn alloc_node(&mut self, page_indices: Vec<PageId>, page_hashes: Vec<u64>, parent: Option<NodeId>) -> NodeId {
        let subtree_size = page_hashes.len();
        let node = Node {
            page_indices,
            page_hashes,
            parent,
            children: BTreeSet::new(),
            subtree_size,
            timestamp: 0,
            is_root: false,
        };
        if let Some(slot) = self.free_slots.pop() {
            self.arena[slot] = Some(node);
            slot
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.node(id).children.iter().copied().collect();
        for c in children {
            self.remove_subtree(c);
        }
        self.arena[id] = None;
        self.free_slots.push(id);
    }

    fn own_len(&self, id: NodeId) -> usize {
        self.node(id).page_hashes.len()
    }

    fn prefix_len(&self, id: NodeId) -> usize {
        let mut total = 0;
        let mut cur = Some(id);
        while let Some(c) = cur {
            total += self.node(c).page_hashes.len();
            cur = self.node(c).parent;
        }
        total
    }

    fn update_subtree_size_bt(&mut self, id: NodeId, diff: i64) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.node_mut(c);
            n.subtree_size = (n.subtree_size as i64 + diff) as usize;
            cur = n.parent;
        }
    }

    fn touch(&mut self, id: NodeId) {
        self.clock += 1;
        let ts = self.clock;
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.node_mut(c);
            n.timestamp = ts;
            cur = n.parent;
        }
    }

    fn dropch(&mut self, parent: NodeId, child: NodeId) {
        let child_subtree = self.node(child).subtree_size;
        self.node_mut(parent).children.remove(&child);
        self.update_subtree_size_bt(parent, -(child_subtree as i64));
    }

    fn addch(&mut self, parent: NodeId, child: NodeId) {
        let child_subtree = self.node(child).subtree_size;
        self.node_mut(parent).children.insert(child);
        self.update_subtree_size_bt(parent, child_subtree as i64);
    }

    fn extend_pagelist(&mut self, id: NodeId, mut page_indices: Vec<PageId>, mut page_hashes: Vec<u64>) {
        let diff = page_hashes.len() as i64;
        let n = self.node_mut(id);
        n.page_indices.append(&mut page_indices);
        n.page_hashes.append(&mut page_hashes);
        self.update_subtree_size_bt(id, diff);
    }

    /// Splits `id` so that exactly `pos` of its hashes remain on the left
    /// half. `pos == 0` returns the parent with `id` untouched as the right
    /// half; `pos == len` is a no-op returning `id` itself.
    fn split(&mut self, id: NodeId, pos: usize) -> (NodeId, Option<NodeId>) {
        if self.node(id).is_root {
            return (id, None);
        }
        let len = self.own_len(id);
        debug_assert!(pos <= len);
        if pos == 0 {
            return (self.node(id).parent.expect("non-root has a parent"), Some(id));
        }
        if pos == len {
            return (id, None);
        }
        let parent = self.node(id).parent.expect("non-root has a parent");
        let n = self.node(id);
        let left_indices = n.page_indices[..pos].to_vec();
        let left_hashes = n.page_hashes[..pos].to_vec();
        let right_indices = n.page_indices[pos..].to_vec();
        let right_hashes = n.page_hashes[pos..].to_vec();
        let children: Vec<NodeId> = n.children.iter().copied().collect();

        let lnode = self.alloc_node(left_indices, left_hashes, Some(parent));
        let rnode = self.alloc_node(right_indices, right_hashes, Some(lnode));

        self.dropch(parent, id);
        self.addch(parent, lnode);
        self.addch(lnode, rnode);
        for c in children {
            self.node_mut(c).parent = Some(rnode);
            self.addch(rnode, c);
        }
        (lnode, Some(rnode))
    }

    fn node_match(&self, id: NodeId, hashes: &[u64]) -> usize {
        let n = self.node(id);
        let min_l = n.page_hashes.len().min(hashes.len());
        let mut matched = 0;
        for i in 0..min_l {
            if n.page_hashes[i] != hashes[i] {
                break;
            }
            matched = i + 1;
        }
        matched
    }

    /// Descends from `start`, consuming as much of `hashes` as matches.
    fn treematch(&self, start: NodeId, hashes: &[u64]) -> Match {
        let mut all_matched = self.prefix_len(start);
        let mut node = start;
        let mut remaining = hashes;
        loop {
            let matched = self.node_match(node, remaining);
            remaining = &remaining[matched..];
            all_matched += matched;
            if matched != self.own_len(node) {
                return Match { matched_len: all_matched, node };
            }
            let mut next = None;
            for &c in &self.node(node).children {
                if self.node_match(c, remaining) > 0 {
                    next = Some(c);
                    break;
                }
            }
            match next {
                Some(c) => node = c,
                None => return Match { matched_len: all_matched, node },
            }
        }
    }

    /// Inserts `page_indices`/`page_hashes` as new content attached at the
    /// position described by `matched`. Returns the leaf node that now
    /// holds (the tail of) the new pages.
    fn add(&mut self, page_indices: Vec<PageId>, page_hashes: Vec<u64>, matched: Match) -> NodeId {
        let node = matched.node;
        let parent_prefix_len = match self.node(node).parent {
            Some(p) => self.prefix_len(p),
            None => 0,
        };
        let at = matched.matched_len - parent_prefix_len;

        if at == 0 {
            debug_assert!(self.node(node).is_root);
            let leaf = self.alloc_node(page_indices, page_hashes, Some(node));
            self.addch(node, leaf);
            self.touch(leaf);
            return leaf;
        }

        debug_assert!(self.node(node).parent.is_some());
        let (lnode, rnode) = self.split(node, at);
        let leaf = if rnode.is_none() && self.node(lnode).children.is_empty() {
            self.extend_pagelist(lnode, page_indices, page_hashes);
            lnode
        } else {
            let leaf = self.alloc_node(page_indices, page_hashes, Some(lnode));
            self.addch(lnode, leaf);
            leaf
        };
        self.touch(leaf);
        leaf
    }

    fn collect_subtree_page_indices(&self, id: NodeId) -> Vec<PageId> {
        let mut out = self.node(id).page_indices.clone();
        for &c in &self.node(id).children {
            out.extend(self.collect_subtree_page_indices(c));
        }
        out
    }

    /// Frees at least `npages` pages from the subtree rooted at `id`,
    /// preferring the least-recently-touched children first, falling back
    /// to truncating `id`'s own tail when its children don't hold enough.
    fn node_free(&mut self, id: NodeId, npages: usize) -> Vec<PageId> {
        if npages == 0 {
            return Vec::new();
        }
        let subtree_size = self.node(id).subtree_size;
        debug_assert!(npages <= subtree_size);
        let own_len = self.own_len(id);
        let children_size = subtree_size - own_len;

        if children_size < npages {
            let rlen = npages - children_size;
            let (lnode, rnode) = self.split(id, own_len - rlen);
            let rnode = rnode.expect("split below full length always yields a right half");
            self.dropch(lnode, rnode);
            let freed = self.collect_subtree_page_indices(rnode);
            self.remove_subtree(rnode);
            return freed;
        }

        let mut lru_children: Vec<NodeId> = self.node(id).children.iter().copied().collect();
        lru_children.sort_by_key(|&c| (self.node(c).timestamp, c));

        let mut freed = Vec::new();
        for c in lru_children {
            if freed.len() >= npages {
                break;
            }
            let want = (npages - freed.len()).min(self.node(c).subtree_size);
            freed.extend(self.node_free(c, want));
        }
        freed
    }
}

/// The tree itself, guarded by a single lock like the original's
/// `threading.Lock`-wrapped `PrefixTree`.
pub struct PrefixTree {
    inner: Mutex<Inner>,
}

impl Default for PrefixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTree {
    pub fn new() -> Self {
        let root = Node {
            page_indices: Vec::new(),
            page_hashes: Vec::new(),
            parent: None,
            children: BTreeSet::new(),
            subtree_size: 0,
            timestamp: 0,
            is_root: true,
        };
        Self {
            inner: Mutex::new(Inner {
                arena: vec![Some(root)],
                free_slots: Vec::new(),
                root: 0,
                clock: 0,
            }),
        }
    }

    pub fn root(&self) -> NodeId {
        self.inner.lock().unwrap().root
    }

    pub fn is_root(&self, node: NodeId) -> bool {
        self.inner.lock().unwrap().node(node).is_root
    }

    pub fn len(&self, node: NodeId) -> usize {
        self.inner.lock().unwrap().own_len(node)
    }

    pub fn prefix_len(&self, node: NodeId) -> usize {
        self.inner.lock().unwrap().prefix_len(node)
    }

    pub fn subtree_size(&self, node: NodeId) -> usize {
        self.inner.lock().unwrap().node(node).subtree_size
    }

    pub fn timestamp(&self, node: NodeId) -> u64 {
        self.inner.lock().unwrap().node(node).timestamp
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.inner.lock().unwrap().node(node).parent
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.inner.lock().unwrap().node(node).children.iter().copied().collect()
    }

    pub fn own_page_indices(&self, node: NodeId) -> Vec<PageId> {
        self.inner.lock().unwrap().node(node).page_indices.clone()
    }

    /// Page indices from the root down to and including `node`.
    pub fn prefix_page_indices(&self, node: NodeId) -> Vec<PageId> {
        let inner = self.inner.lock().unwrap();
        let mut chain = Vec::new();
        let mut cur = Some(node);
        while let Some(c) = cur {
            chain.push(c);
            cur = inner.node(c).parent;
        }
        chain.reverse();
        let mut out = Vec::new();
        for c in chain {
            out.extend(inner.node(c).page_indices.iter().copied());
        }
        out
    }

    /// Matches `hashes` against the tree, splitting the landing node so the
    /// returned match always sits exactly on a node boundary.
    pub fn match_hashes(&self, hashes: &[u64]) -> Match {
        let mut inner = self.inner.lock().unwrap();
        let root = inner.root;
        let m = inner.treematch(root, hashes);
        if m.node == root {
            return m;
        }
        let parent_prefix_len = match inner.node(m.node).parent {
            Some(p) => inner.prefix_len(p),
            None => 0,
        };
        let at = m.matched_len - parent_prefix_len;
        let (lnode, _) = inner.split(m.node, at);
        inner.touch(lnode);
        Match { matched_len: m.matched_len, node: lnode }
    }

    pub fn add(&self, page_indices: Vec<PageId>, page_hashes: Vec<u64>, matched: Match) -> NodeId {
        let mut inner = self.inner.lock().unwrap();
        inner.add(page_indices, page_hashes, matched)
    }

    /// Splits `node` at `pos` hashes without touching timestamps — used by
    /// the paged cache's `plan` when no new pages are being appended.
    pub fn split(&self, node: NodeId, pos: usize) -> (NodeId, Option<NodeId>) {
        let mut inner = self.inner.lock().unwrap();
        inner.split(node, pos)
    }

    /// Rewrites the hash of `node`'s last page (it grew since it was last
    /// hashed) and refreshes timestamps up to root.
    pub fn modify(&self, leaf: NodeId, new_last_hash: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.node(leaf).children.is_empty());
        let idx = inner.node(leaf).page_hashes.len() - 1;
        inner.node_mut(leaf).page_hashes[idx] = new_last_hash;
        inner.touch(leaf);
    }

    /// Evicts at least `npages` pages using LRU-by-subtree discipline,
    /// returning the freed page ids for `PageTable::free`.
    pub fn free(&self, npages: usize) -> Vec<PageId> {
        let mut inner = self.inner.lock().unwrap();
        let root = inner.root;
        inner.node_free(root, npages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(vals: &[u64]) -> Vec<u64> {
        vals.to_vec()
    }

    #[test]
    fn match_on_empty_tree_is_root() {
        let tree = PrefixTree::new();
        let m = tree.match_hashes(&hashes(&[1, 2, 3]));
        assert_eq!(m.matched_len, 0);
        assert_eq!(m.node, tree.root());
    }

    #[test]
    fn add_then_match_is_idempotent() {
        let tree = PrefixTree::new();
        let m0 = tree.match_hashes(&hashes(&[1, 2, 3]));
        let leaf = tree.add(vec![10, 11, 12], hashes(&[1, 2, 3]), m0);
        let m1 = tree.match_hashes(&hashes(&[1, 2, 3]));
        assert_eq!(m1.matched_len, 3);
        assert_eq!(m1.node, leaf);
        // matching again changes nothing about tree shape
        let m2 = tree.match_hashes(&hashes(&[1, 2, 3]));
        assert_eq!(m2.node, m1.node);
        assert_eq!(m2.matched_len, m1.matched_len);
    }

    #[test]
    fn partial_match_splits_at_divergence() {
        let tree = PrefixTree::new();
        let m0 = tree.match_hashes(&hashes(&[1, 2, 3, 4]));
        tree.add(vec![10, 11, 12, 13], hashes(&[1, 2, 3, 4]), m0);
        let m1 = tree.match_hashes(&hashes(&[1, 2, 9, 9]));
        assert_eq!(m1.matched_len, 2);
        assert_eq!(tree.prefix_len(m1.node), 2);
    }

    #[test]
    fn subtree_size_invariant_holds_after_inserts() {
        let tree = PrefixTree::new();
        let m0 = tree.match_hashes(&hashes(&[1, 2, 3]));
        let n1 = tree.add(vec![10, 11, 12], hashes(&[1, 2, 3]), m0);
        let m1 = tree.match_hashes(&hashes(&[1, 2, 3, 4, 5]));
        tree.add(vec![13, 14], hashes(&[1, 2, 3, 4, 5]), m1);
        assert_eq!(tree.subtree_size(n1), 2 + tree.len(n1));
        assert_eq!(tree.subtree_size(tree.root()), 5);
    }

    #[test]
    fn free_evicts_lru_leaf_first() {
        let tree = PrefixTree::new();
        let ma = tree.match_hashes(&hashes(&[1]));
        tree.add(vec![100], hashes(&[1]), ma);
        let mb = tree.match_hashes(&hashes(&[2]));
        tree.add(vec![200], hashes(&[2]), mb);
        // touch branch "1" again so branch "2" becomes the LRU one
        tree.match_hashes(&hashes(&[1]));
        let freed = tree.free(1);
        assert_eq!(freed, vec![200]);
        assert_eq!(tree.subtree_size(tree.root()), 1);
    }

    #[test]
    fn free_never_exceeds_requested_subtree() {
        let tree = PrefixTree::new();
        let m0 = tree.match_hashes(&hashes(&[1, 2, 3]));
        tree.add(vec![10, 11, 12], hashes(&[1, 2, 3]), m0);
        let freed = tree.free(2);
        assert_eq!(freed.len(), 2);
        assert_eq!(tree.subtree_size(tree.root()), 1);
    }
}
