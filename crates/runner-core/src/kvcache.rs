//! Paged KV-cache: ties `PageTable` allocation to `PrefixTree` reuse and
//! produces the flat buffers (`page_indices`/`page_indptr`/`last_page_len`)
//! an attention kernel would consume.
//!
//! Grounded on `engine/heyi/utils/kvcache/kvcache.py` (`PagedKVCache.match`,
//! `.plan`, `.update`, `.fork`, `do_page_hash`, `n_pages`). The hash
//! function and the `-1` padding sentinel resolve Open Question #2 from the
//! distilled spec by following `do_page_hash` directly.

use std::sync::Arc;

use runner_backend::{DeviceTarget, KvAppendKernel, KvStorage};
use runner_common::{n_pages, Result};

use crate::pagetable::{PageId, PageTable};
use crate::prefixtree::{Match, NodeId, PrefixTree};

/// Polynomial hash (multiplier 31) over a page's token ids, in wrapping
/// 64-bit two's-complement arithmetic. No collision handling — matching the
/// original, a hash collision between distinct page contents is an accepted
/// (and undetected) limitation of this design.
fn page_hash(tokens: &[i64]) -> u64 {
    let mut h: i64 = 0;
    for &t in tokens {
        h = h.wrapping_mul(31).wrapping_add(t);
    }
    h as u64
}

/// Hashes `tokens` page by page. `trim == true` (used by `match`) drops an
/// incomplete trailing page entirely; `trim == false` (used by `plan`) pads
/// the trailing page with sentinel `-1` tokens up to `page_size`.
pub fn do_page_hash(tokens: &[i64], page_size: usize, trim: bool) -> Vec<u64> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let full_pages = tokens.len() / page_size;
    let mut out = Vec::with_capacity(n_pages(tokens.len(), page_size));
    for p in 0..full_pages {
        out.push(page_hash(&tokens[p * page_size..(p + 1) * page_size]));
    }
    let rem = &tokens[full_pages * page_size..];
    if !rem.is_empty() {
        if trim {
            // incomplete trailing page dropped
        } else {
            let mut buf = rem.to_vec();
            buf.resize(page_size, -1);
            out.push(page_hash(&buf));
        }
    }
    out
}

/// Per-runner scratch buffers produced by `plan`, laid out the way a
/// ragged/paged attention kernel expects: `page_indices[page_indptr[i] ..
/// page_indptr[i+1]]` are request `i`'s pages root-to-leaf, and
/// `last_page_len[i]` is how many of the last page's slots are filled.
#[derive(Debug, Clone, Default)]
pub struct PlanBuffers {
    pub page_indices: Vec<PageId>,
    pub page_indptr: Vec<usize>,
    pub last_page_len: Vec<u16>,
}

pub struct PagedKVCache {
    page_table: Arc<PageTable>,
    prefix_tree: Arc<PrefixTree>,
    page_size: usize,
    buffers: PlanBuffers,
}

impl PagedKVCache {
    pub fn new(page_table: Arc<PageTable>, prefix_tree: Arc<PrefixTree>) -> Self {
        let page_size = page_table.page_size();
        Self {
            page_table,
            prefix_tree,
            page_size,
            buffers: PlanBuffers { page_indptr: vec![0], ..Default::default() },
        }
    }

    pub fn with_capacity(max_num_pages: usize, page_size: usize) -> Self {
        Self::new(Arc::new(PageTable::new(max_num_pages, page_size)), Arc::new(PrefixTree::new()))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }

    pub fn prefix_tree(&self) -> &Arc<PrefixTree> {
        &self.prefix_tree
    }

    pub fn buffers(&self) -> &PlanBuffers {
        &self.buffers
    }

    /// Forks a runner-local view that shares the underlying page table and
    /// prefix tree (both already internally synchronized) but owns its own
    /// scratch buffers. Grounded on `PagedKVCache.fork`.
    pub fn fork(&self) -> Self {
        Self {
            page_table: self.page_table.clone(),
            prefix_tree: self.prefix_tree.clone(),
            page_size: self.page_size,
            buffers: PlanBuffers { page_indptr: vec![0], ..Default::default() },
        }
    }

    /// Matches each sequence's full-page hashes against the tree. Used for
    /// admission-time cache-hit accounting and the initial match handed to
    /// `plan`.
    pub fn match_batch(&self, sequences: &[Vec<i64>]) -> Vec<Match> {
        sequences
            .iter()
            .map(|seq| {
                let hashes = do_page_hash(seq, self.page_size, true);
                self.prefix_tree.match_hashes(&hashes)
            })
            .collect()
    }

    /// Extends the cache to cover `all_ids` beyond each existing match,
    /// allocating new pages (evicting via `PrefixTree::free` under pressure)
    /// and writing the flat plan buffers attention kernels consume.
    ///
    /// `matches[i]` must sit exactly on a tree-node boundary — true of any
    /// match returned by `match_batch` or by a previous call to `plan`.
    pub fn plan(&mut self, matches: Vec<Match>, all_ids: &[Vec<i64>]) -> Result<Vec<Match>> {
        let root = self.prefix_tree.root();
        self.buffers.page_indices.clear();
        self.buffers.page_indptr.clear();
        self.buffers.page_indptr.push(0);
        self.buffers.last_page_len.clear();

        let mut ret_matches = Vec::with_capacity(matches.len());

        for (i, m) in matches.into_iter().enumerate() {
            let Match { matched_len: l, node } = m;
            let is_root = node == root;

            let (pages_needed, append_page_ids, last_page_idx_hint): (usize, Vec<i64>, Option<PageId>) = if is_root {
                let append = all_ids[i].clone();
                (n_pages(append.len(), self.page_size), append, None)
            } else {
                debug_assert_eq!(l, self.prefix_tree.prefix_len(node), "plan() requires boundary-aligned matches");
                let offset = (l - 1) * self.page_size;
                let relative_ids = &all_ids[i][offset..];
                let last_page_ids = &relative_ids[..relative_ids.len().min(self.page_size)];
                let append_page_ids: Vec<i64> = if relative_ids.len() > self.page_size {
                    relative_ids[self.page_size..].to_vec()
                } else {
                    Vec::new()
                };

                let own_pages = self.prefix_tree.own_page_indices(node);
                let last_page_idx = *own_pages.last().expect("non-root node owns at least one page");
                if self.page_table.page_filled_len(last_page_idx) < self.page_size as u16 {
                    let new_hash = do_page_hash(last_page_ids, self.page_size, false)[0];
                    self.prefix_tree.modify(node, new_hash);
                }

                let pages_needed = n_pages(append_page_ids.len(), self.page_size);
                if pages_needed > 0 {
                    self.page_table.set_page_filled_len(&[last_page_idx], &[self.page_size as u16]);
                }
                (pages_needed, append_page_ids, Some(last_page_idx))
            };

            let (leaf, last_page): (NodeId, PageId) = if pages_needed > 0 {
                if pages_needed > self.page_table.n_free_pages() {
                    let shortfall = pages_needed - self.page_table.n_free_pages();
                    let evictable = self.prefix_tree.subtree_size(root).min(shortfall);
                    if evictable > 0 {
                        let freed = self.prefix_tree.free(evictable);
                        self.page_table.free(&freed);
                    }
                }
                let new_pages = self.page_table.allocate(pages_needed)?;
                let last_page = *new_pages.last().unwrap();
                let mut fill_lens = vec![self.page_size as u16; new_pages.len()];
                let rem = append_page_ids.len() % self.page_size;
                *fill_lens.last_mut().unwrap() = if rem == 0 { self.page_size as u16 } else { rem as u16 };
                self.page_table.set_page_filled_len(&new_pages, &fill_lens);

                let hashes = do_page_hash(&append_page_ids, self.page_size, false);
                let leaf = self.prefix_tree.add(new_pages, hashes, Match { matched_len: l, node });
                (leaf, last_page)
            } else if is_root {
                (node, 0)
            } else {
                let parent = self.prefix_tree.parent(node).expect("non-root node has a parent");
                let pos = l - self.prefix_tree.prefix_len(parent);
                let (leaf, _) = self.prefix_tree.split(node, pos);
                let last_page = *self.prefix_tree.own_page_indices(leaf).last().unwrap();
                let relative_len = all_ids[i].len() - (l - 1) * self.page_size;
                let last_page_len = relative_len.min(self.page_size);
                self.page_table.set_page_filled_len(&[last_page], &[last_page_len as u16]);
                (leaf, last_page)
            };

            let _ = last_page_idx_hint;
            let prefix_len = self.prefix_tree.prefix_len(leaf);
            let start = *self.buffers.page_indptr.last().unwrap();
            self.buffers.page_indptr.push(start + prefix_len);
            self.buffers.page_indices.extend(self.prefix_tree.prefix_page_indices(leaf));
            let last_page_len = if is_root && pages_needed == 0 { 0 } else { self.page_table.page_filled_len(last_page) };
            self.buffers.last_page_len.push(last_page_len);

            ret_matches.push(Match { matched_len: prefix_len, node: leaf });
        }

        Ok(ret_matches)
    }

    /// Migrates this cache's pages between host and device, grounded on
    /// `PagedKVCache.to_(device, layer=None)` forwarding straight to
    /// `self.page_table.to_(device, layer)`.
    pub fn to_device(&self, storage: &dyn KvStorage, target: DeviceTarget, layer: Option<usize>) -> Result<()> {
        self.page_table.to_device(storage, target, layer)
    }

    /// Writes a forward step's freshly-computed K/V into the pages the last
    /// `plan` call laid out, grounded on `PagedMLACache.update`/
    /// `PagedGQACache.update` forwarding to `self.page_table.update(...)`
    /// with the current plan buffers.
    pub fn update(&self, kernel: &dyn KvAppendKernel, layer: usize) -> Result<()> {
        kernel.append(layer, &self.buffers.page_indices, &self.buffers.page_indptr, &self.buffers.last_page_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_hash_matches_polynomial_definition() {
        let h = page_hash(&[1, 2, 3]);
        let expected = ((1_i64).wrapping_mul(31).wrapping_add(2)).wrapping_mul(31).wrapping_add(3) as u64;
        assert_eq!(h, expected);
    }

    #[test]
    fn trim_drops_incomplete_page_no_pad_keeps() {
        let tokens: Vec<i64> = (0..10).collect();
        let trimmed = do_page_hash(&tokens, 4, true);
        let padded = do_page_hash(&tokens, 4, false);
        assert_eq!(trimmed.len(), 2); // 8 full tokens -> 2 pages, trailing 2 dropped
        assert_eq!(padded.len(), 3); // trailing 2 padded with -1 into a 3rd page
    }

    #[test]
    fn plan_allocates_one_page_per_chunk_and_reuses_on_exact_rematch() {
        let mut kv = PagedKVCache::with_capacity(16, 4);
        let seq: Vec<i64> = (0..8).collect();
        let m0 = kv.match_batch(&[seq.clone()]);
        let planned = kv.plan(m0, &[seq.clone()]).unwrap();
        assert_eq!(kv.page_table().n_used_pages(), 2);
        assert_eq!(planned[0].matched_len, 2);

        // re-matching the exact same (now fully-paged) sequence should hit
        // the cache fully without allocating more pages.
        let m1 = kv.match_batch(&[seq.clone()]);
        assert_eq!(m1[0].matched_len, 2);
        let planned2 = kv.plan(m1, &[seq]).unwrap();
        assert_eq!(kv.page_table().n_used_pages(), 2);
        assert_eq!(planned2[0].matched_len, 2);
    }

    #[test]
    fn plan_never_exceeds_capacity() {
        let mut kv = PagedKVCache::with_capacity(2, 4);
        let seq: Vec<i64> = (0..16).collect(); // needs 4 pages, only 2 available
        let m0 = kv.match_batch(&[seq.clone()]);
        let err = kv.plan(m0, &[seq]).unwrap_err();
        assert!(matches!(err, runner_common::RunnerError::CapacityExceeded { .. }));
    }
}
