use std::sync::Arc;

use runner_common::Result;

#[derive(Debug, Clone, Default)]
pub struct LoadParams {
    pub n_ctx: usize,
    pub n_gpu_layers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModelHandle;

#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub used_pages: usize,
    pub capacity_pages: usize,
}

/// MLA vs GQA attention-head layout. Grounded on the "Dynamic dispatch over
/// model variants" design note and the `MLA_LPrefillRunner` /
/// `GQA_LPrefillRunner` split in `runner/prefill_runner.py` — one capability
/// trait replaces that subclass pair so the core scheduler stays generic
/// over either variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Mla,
    Gqa,
}

/// The shape facts an attention kernel's `plan()` call needs ahead of a
/// forward pass. Grounded on `_wrapper_plan` in both
/// `MLA_LPrefillRunner`/`GQA_LPrefillRunner` and the analogous
/// `wrapper_plan_decode1`/`wrapper_plan_cprefill` in `decode_runner.py`.
pub trait AttentionPlanner: Send + Sync {
    fn variant(&self) -> ModelVariant;
    fn num_qo_heads(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_dim_qk(&self) -> usize;
    /// `None` for MLA, where qk/vo share one latent dimension.
    fn head_dim_vo(&self) -> Option<usize>;
}

/// One forward step's inputs. `past_key_values` is represented by the paged
/// cache's already-planned flat buffers rather than a live tensor handle —
/// the KV storage and attention kernel themselves are out of scope.
/// `input_ids[i]`/`cache_position[i]` is request `i`'s chunk (length 1 for
/// a continuous-batching decode step, the whole prompt or one prefill chunk
/// otherwise); exactly one next-token logits row is produced per request
/// regardless of chunk length, matching the `squeeze(dim=1)` in
/// `decode_runner.py`/`prefill_runner.py`.
pub struct ForwardRequest<'a> {
    pub input_ids: &'a [Vec<i64>],
    pub cache_position: &'a [Vec<usize>],
    pub page_indices: &'a [usize],
    pub page_indptr: &'a [usize],
    pub last_page_len: &'a [u16],
    pub use_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardOutput {
    pub logits: Vec<Vec<f32>>,
}

/// Appends freshly-computed K/V into device storage at the pages a
/// `PagedKVCache::plan` call laid out. Out of scope to actually move bytes
/// here; `runner-backend-llamacpp` is the reference implementation.
pub trait KvAppendKernel: Send + Sync {
    fn append(&self, layer: usize, page_indices: &[usize], page_indptr: &[usize], last_page_len: &[u16]) -> Result<()>;
}

/// Host vs. device placement for a `PagedKVCache::to_device` migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTarget {
    Host,
    Device,
}

/// Owns the main model's per-layer KV storage and can migrate it between
/// host and device. Backs `PageTable::to_device`/`PagedKVCache::to_device`;
/// moving actual bytes is out of scope (no device memory here), so
/// implementations just record/acknowledge the request. `layer == None`
/// means every layer.
pub trait KvStorage: Send + Sync {
    fn to_device(&self, target: DeviceTarget, layer: Option<usize>) -> Result<()>;
}

/// No-op `KvStorage` for backends with no main-model KV to evict (e.g. the
/// mock/echo backend).
pub struct NoopKvStorage;
impl KvStorage for NoopKvStorage {
    fn to_device(&self, _target: DeviceTarget, _layer: Option<usize>) -> Result<()> {
        Ok(())
    }
}

pub trait InferenceBackend: Send + Sync {
    fn load_model(&self, path: &str, params: LoadParams) -> Result<ModelHandle>;
    fn tokenize(&self, text: &str) -> Result<Vec<i64>>;
    fn detokenize(&self, tokens: &[i64]) -> Result<String>;
    fn forward(&self, req: ForwardRequest<'_>) -> Result<ForwardOutput>;
    fn kv_usage(&self) -> KvStats;
    fn eos_token(&self) -> i64;
    fn variant(&self) -> ModelVariant;
    fn vocab_size(&self) -> usize;

    /// The collaborator that can evict/restore this backend's main-model KV
    /// for co-located layerwise prefill. Default: nothing to evict.
    fn kv_storage(&self) -> Arc<dyn KvStorage> {
        Arc::new(NoopKvStorage)
    }

    /// The collaborator that writes a forward step's freshly-computed K/V
    /// into the pages `PagedKVCache::plan` laid out. Default: no real KV
    /// storage to append into.
    fn kv_append_kernel(&self) -> Option<Arc<dyn KvAppendKernel>> {
        None
    }
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;

    /// Byte-level echo backend for tests and local smoke-runs: tokenizes
    /// to raw bytes, "forwards" by peaking the logit at the next byte of
    /// whatever request this chunk belongs to (wrapping at the vocab),
    /// which keeps sampling deterministic without a real model.
    pub struct MockBackend {
        pub vocab_size: usize,
        pub eos_token: i64,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self { vocab_size: 256, eos_token: 0 }
        }
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl InferenceBackend for MockBackend {
        fn load_model(&self, _path: &str, _params: LoadParams) -> Result<ModelHandle> {
            Ok(ModelHandle::default())
        }

        fn tokenize(&self, text: &str) -> Result<Vec<i64>> {
            Ok(text.as_bytes().iter().map(|b| *b as i64).collect())
        }

        fn detokenize(&self, tokens: &[i64]) -> Result<String> {
            let bytes: Vec<u8> = tokens.iter().map(|t| (*t as u32 % 256) as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).to_string())
        }

        fn forward(&self, req: ForwardRequest<'_>) -> Result<ForwardOutput> {
            let mut logits = Vec::with_capacity(req.input_ids.len());
            for chunk in req.input_ids {
                let mut row = vec![0.0_f32; self.vocab_size];
                let last = *chunk.last().unwrap_or(&0);
                let next = ((last + 1) as usize) % self.vocab_size;
                row[next] = 10.0;
                logits.push(row);
            }
            Ok(ForwardOutput { logits })
        }

        fn kv_usage(&self) -> KvStats {
            KvStats::default()
        }

        fn eos_token(&self) -> i64 {
            self.eos_token
        }

        fn variant(&self) -> ModelVariant {
            ModelVariant::Gqa
        }

        fn vocab_size(&self) -> usize {
            self.vocab_size
        }
    }
}
