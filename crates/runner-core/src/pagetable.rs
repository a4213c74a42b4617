//! Fixed-size page allocator backing the paged KV-cache.
//!
//! Grounded on `utils/kvcache/pagetable.py::PageTable` (`allocate`, `free`,
//! `set_page_filled_len`), generalized from torch tensors to plain
//! collections since the attention kernels that actually read/write page
//! contents are out of scope here.

use std::collections::BTreeSet;
use std::sync::Mutex;

use runner_backend::{DeviceTarget, KvStorage};
use runner_common::{Result, RunnerError};

pub type PageId = usize;

struct Inner {
    free: BTreeSet<PageId>,
    used: BTreeSet<PageId>,
    page_filled_len: Vec<u16>,
}

/// Tracks which fixed-size pages are free/used and how full each used page
/// currently is. Mutex-guarded so it can be shared read-write across runner
/// forks.
pub struct PageTable {
    inner: Mutex<Inner>,
    capacity: usize,
    page_size: usize,
}

impl PageTable {
    pub fn new(capacity: usize, page_size: usize) -> Self {
        let free = (0..capacity).collect();
        Self {
            inner: Mutex::new(Inner {
                free,
                used: BTreeSet::new(),
                page_filled_len: vec![0; capacity],
            }),
            capacity,
            page_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn n_free_pages(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn n_used_pages(&self) -> usize {
        self.inner.lock().unwrap().used.len()
    }

    /// Allocates exactly `n` pages or none at all — never a partial grant.
    pub fn allocate(&self, n: usize) -> Result<Vec<PageId>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.len() < n {
            return Err(RunnerError::CapacityExceeded {
                requested: n,
                available: inner.free.len(),
            });
        }
        let ids: Vec<PageId> = inner.free.iter().take(n).copied().collect();
        for &id in &ids {
            inner.free.remove(&id);
            inner.used.insert(id);
        }
        Ok(ids)
    }

    pub fn free(&self, indices: &[PageId]) {
        let mut inner = self.inner.lock().unwrap();
        for &idx in indices {
            inner.used.remove(&idx);
            inner.free.insert(idx);
            inner.page_filled_len[idx] = 0;
        }
    }

    pub fn set_page_filled_len(&self, indices: &[PageId], lens: &[u16]) {
        debug_assert_eq!(indices.len(), lens.len());
        let mut inner = self.inner.lock().unwrap();
        for (&idx, &len) in indices.iter().zip(lens.iter()) {
            debug_assert!(len as usize <= self.page_size);
            inner.page_filled_len[idx] = len;
        }
    }

    pub fn page_filled_len(&self, idx: PageId) -> u16 {
        self.inner.lock().unwrap().page_filled_len[idx]
    }

    /// Migrates one layer's pages (or all layers, if `layer` is `None`)
    /// between host and device, grounded on `PageTable.to_(device, layer=None)`:
    /// iterates every layer's storage when `layer` is unset, otherwise touches
    /// just that one. The actual byte movement lives in `storage`; this call
    /// only carries the layer-scoping decision across the boundary.
    pub fn to_device(&self, storage: &dyn KvStorage, target: DeviceTarget, layer: Option<usize>) -> Result<()> {
        storage.to_device(target, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_all_or_nothing() {
        let pt = PageTable::new(4, 64);
        assert!(pt.allocate(5).is_err());
        assert_eq!(pt.n_used_pages(), 0);
        let got = pt.allocate(4).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(pt.n_free_pages(), 0);
    }

    #[test]
    fn free_resets_filled_len() {
        let pt = PageTable::new(2, 64);
        let ids = pt.allocate(2).unwrap();
        pt.set_page_filled_len(&ids, &[64, 30]);
        assert_eq!(pt.page_filled_len(ids[1]), 30);
        pt.free(&ids);
        assert_eq!(pt.n_free_pages(), 2);
        assert_eq!(pt.page_filled_len(ids[1]), 0);
    }
}
