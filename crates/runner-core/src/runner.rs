//! Per-runner decode/prefill drivers.
//!
//! Grounded on `runner/decode_runner.py` (`DecodeRunner::plan_decode1`/
//! `decode1`/`prefill_chunk`) and `runner/prefill_runner.py`
//! (`PrefillRunner::prefill`). The CUDA-graph warmup path, the MLA/GQA
//! `_wrapper_plan` split, and the flashinfer workspace buffers are out of
//! scope (no real attention kernel); what's kept is the planning sequence
//! that ties a request's prompt/cache-position window to a `PagedKVCache`
//! plan and a backend forward call, and the `AttentionPlanner` capability
//! split that used to be a `MLA_LPrefillRunner`/`GQA_LPrefillRunner` pair.

use std::collections::HashMap;
use std::sync::Arc;

use runner_backend::{AttentionPlanner, ForwardRequest, InferenceBackend};
use runner_common::Result;

use crate::kvcache::PagedKVCache;
use crate::request::{DecodeBatch, Request};

/// Each forward call here already encompasses every transformer layer (no
/// per-layer loop is exposed across the `InferenceBackend` boundary), so the
/// one `PagedKVCache::update`/`to_device` call per step always targets this
/// nominal layer index.
const ONLY_LAYER: usize = 0;

/// Shared identity across decode and prefill runners; method sets genuinely
/// differ (`DecodeRunnerOps` batches many requests per step, `PrefillRunnerOps`
/// drives one request through a chunk or a whole prompt), so no single
/// `Runner` trait is forced over both.
pub trait RunnerId {
    fn runner_id(&self) -> usize;
}

pub trait DecodeRunnerOps: RunnerId {
    /// Matches + plans KV pages for one decode step across a batch, grounded
    /// on `plan_decode1` (cuda-graph buffer copies dropped — no device
    /// buffers here, the planned page buffers live in this runner's cache
    /// fork and are consumed straight by `decode1`). Writes the advanced
    /// match for each request back into `reqs`, matching `DecodeBatch.matches`'
    /// setter in `request.py`, which assigns into `req.matches` as it goes.
    fn plan_decode1(&mut self, batch: &mut DecodeBatch, reqs: &mut HashMap<String, Request>) -> Result<()>;

    /// Runs one next-token forward for every request in `batch`, grounded on
    /// `decode1`'s `squeeze(dim=1)` per-request logits row.
    fn decode1(&self, batch: &DecodeBatch, reqs: &HashMap<String, Request>) -> Result<Vec<Vec<f32>>>;

    /// Re-establishes decode-readiness after this runner's KV storage was
    /// evicted/restored for a co-located layerwise prefill. CUDA-graph
    /// capture is out of scope, so this is a no-op hook by default.
    fn warmup(&self) {}
}

pub trait PrefillRunnerOps: RunnerId {
    /// One chunk of a request's prompt. Grounded on `prefill_chunk`.
    fn prefill_chunk(&mut self, req: &mut Request, chunk_size: usize) -> Result<Vec<f32>>;

    /// The whole prompt in one shot, used by the layerwise-prefill path.
    /// Grounded on `PrefillRunner::prefill`.
    fn prefill(&mut self, req: &mut Request) -> Result<Vec<f32>>;
}

pub struct DecodeRunner {
    id: usize,
    backend: Arc<dyn InferenceBackend>,
    planner: Arc<dyn AttentionPlanner>,
    cache: PagedKVCache,
}

impl DecodeRunner {
    pub fn new(id: usize, backend: Arc<dyn InferenceBackend>, planner: Arc<dyn AttentionPlanner>, cache: PagedKVCache) -> Self {
        Self { id, backend, planner, cache }
    }

    pub fn cache(&self) -> &PagedKVCache {
        &self.cache
    }
}

impl RunnerId for DecodeRunner {
    fn runner_id(&self) -> usize {
        self.id
    }
}

impl DecodeRunnerOps for DecodeRunner {
    fn plan_decode1(&mut self, batch: &mut DecodeBatch, reqs: &mut HashMap<String, Request>) -> Result<()> {
        batch.decode_runner_id = Some(self.id);
        let all_ids = batch.all_ids(reqs);
        let matches = std::mem::take(&mut batch.matches);
        debug_assert_eq!(matches.len(), all_ids.len(), "plan_decode1 requires one match per batch request");
        batch.matches = self.cache.plan(matches, &all_ids)?;
        for (id, &m) in batch.req_ids.iter().zip(batch.matches.iter()) {
            reqs.get_mut(id).unwrap().matches = Some(m);
        }
        let _ = self.planner.variant();
        Ok(())
    }

    fn decode1(&self, batch: &DecodeBatch, reqs: &HashMap<String, Request>) -> Result<Vec<Vec<f32>>> {
        let (input_ids, cache_position) = batch.next_token_inputs(reqs);
        let input_ids: Vec<Vec<i64>> = input_ids.into_iter().map(|t| vec![t]).collect();
        let cache_position: Vec<Vec<usize>> = cache_position.into_iter().map(|p| vec![p]).collect();
        let buffers = self.cache.buffers();
        let out = self.backend.forward(ForwardRequest {
            input_ids: &input_ids,
            cache_position: &cache_position,
            page_indices: &buffers.page_indices,
            page_indptr: &buffers.page_indptr,
            last_page_len: &buffers.last_page_len,
            use_cache: true,
        })?;
        if let Some(kernel) = self.backend.kv_append_kernel() {
            self.cache.update(kernel.as_ref(), ONLY_LAYER)?;
        }
        Ok(out.logits)
    }
}

pub struct PrefillRunner {
    id: usize,
    backend: Arc<dyn InferenceBackend>,
    planner: Arc<dyn AttentionPlanner>,
    cache: PagedKVCache,
}

impl PrefillRunner {
    pub fn new(id: usize, backend: Arc<dyn InferenceBackend>, planner: Arc<dyn AttentionPlanner>, cache: PagedKVCache) -> Self {
        Self { id, backend, planner, cache }
    }

    pub fn cache(&self) -> &PagedKVCache {
        &self.cache
    }
}

impl RunnerId for PrefillRunner {
    fn runner_id(&self) -> usize {
        self.id
    }
}

impl PrefillRunnerOps for PrefillRunner {
    fn prefill_chunk(&mut self, req: &mut Request, chunk_size: usize) -> Result<Vec<f32>> {
        if req.matches.is_none() {
            req.matches = Some(self.cache.match_batch(&[req.all_ids[..req.all_length()].to_vec()]).remove(0));
        }
        let m = req.matches.take().unwrap();
        req.prefilled_length = m.matched_len * self.cache.page_size();

        let (chunk, positions) = req.next_chunk(chunk_size);
        let end = *positions.last().unwrap_or(&0) + 1;
        let planned = self.cache.plan(vec![m], &[req.all_ids[..end].to_vec()])?;
        req.matches = planned.into_iter().next();

        let _ = self.planner.variant();
        let buffers = self.cache.buffers();
        let out = self.backend.forward(ForwardRequest {
            input_ids: &[chunk],
            cache_position: &[positions],
            page_indices: &buffers.page_indices,
            page_indptr: &buffers.page_indptr,
            last_page_len: &buffers.last_page_len,
            use_cache: true,
        })?;
        if let Some(kernel) = self.backend.kv_append_kernel() {
            self.cache.update(kernel.as_ref(), ONLY_LAYER)?;
        }
        Ok(out.logits.into_iter().next().unwrap_or_default())
    }

    fn prefill(&mut self, req: &mut Request) -> Result<Vec<f32>> {
        let m = self.cache.match_batch(&[req.all_ids[..req.all_length()].to_vec()]).remove(0);
        req.prefilled_length = m.matched_len * self.cache.page_size();

        let (prompt, positions) = req.next_full_prefill();
        let end = *positions.last().unwrap_or(&0) + 1;
        let planned = self.cache.plan(vec![m], &[req.all_ids[..end].to_vec()])?;
        req.matches = planned.into_iter().next();

        let _ = self.planner.variant();
        let buffers = self.cache.buffers();
        let out = self.backend.forward(ForwardRequest {
            input_ids: &[prompt],
            cache_position: &[positions],
            page_indices: &buffers.page_indices,
            page_indptr: &buffers.page_indptr,
            last_page_len: &buffers.last_page_len,
            use_cache: true,
        })?;
        if let Some(kernel) = self.backend.kv_append_kernel() {
            self.cache.update(kernel.as_ref(), ONLY_LAYER)?;
        }
        Ok(out.logits.into_iter().next().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::async_stream;
    use runner_backend::mock::MockBackend;
    use std::collections::HashMap;

    fn planner() -> Arc<dyn AttentionPlanner> {
        struct P;
        impl AttentionPlanner for P {
            fn variant(&self) -> runner_backend::ModelVariant {
                runner_backend::ModelVariant::Gqa
            }
            fn num_qo_heads(&self) -> usize {
                8
            }
            fn num_kv_heads(&self) -> usize {
                8
            }
            fn head_dim_qk(&self) -> usize {
                64
            }
            fn head_dim_vo(&self) -> Option<usize> {
                Some(64)
            }
        }
        Arc::new(P)
    }

    #[test]
    fn prefill_chunk_advances_prefilled_length() {
        let cache = PagedKVCache::with_capacity(8, 4);
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        let mut runner = PrefillRunner::new(0, backend, planner(), cache);
        let (tx, _rx) = async_stream();
        let mut req = Request::new("r1".into(), vec![1, 2, 3, 4, 5, 6], 100, 50, tx);

        let logits = runner.prefill_chunk(&mut req, 4).unwrap();
        assert!(!logits.is_empty());
        assert_eq!(req.prefilled_length, 0); // no cache hit on a cold tree
    }

    #[test]
    fn decode1_produces_one_row_per_request() {
        let cache = PagedKVCache::with_capacity(8, 4);
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        let mut runner = DecodeRunner::new(0, backend, planner(), cache);

        let (tx1, _rx1) = async_stream();
        let (tx2, _rx2) = async_stream();
        let mut reqs = HashMap::new();
        reqs.insert("a".to_string(), Request::new("a".into(), vec![1, 2, 3], 100, 50, tx1));
        reqs.insert("b".to_string(), Request::new("b".into(), vec![4, 5], 100, 50, tx2));

        let mut batch = DecodeBatch::new(vec!["a".to_string(), "b".to_string()], &[1, 2, 4]);
        batch.matches = runner.cache().match_batch(&batch.all_ids(&reqs));
        runner.plan_decode1(&mut batch, &mut reqs).unwrap();
        let logits = runner.decode1(&batch, &reqs).unwrap();
        assert_eq!(logits.len(), 2);
    }
}
