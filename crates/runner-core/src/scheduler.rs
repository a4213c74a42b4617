//! The engine: owns every request in flight and drives prefill/decode
//! scheduling. Grounded 1:1 on `engine.py`'s `Engine` (`boot`,
//! `run_engine_loop`, `_handle_finished_reqs`, `_summarize_kvcache_usage`,
//! `_schedule_layerwise_prefill`, `_handle_layerwise_prefill`,
//! `_handle_chunked_prefill`, `_continuous_batching`,
//! `_handle_decode_substep`, `submit`, `cancel`, `get_status`). No
//! `Singleton` base class: the engine is constructed once by the caller and
//! held behind a handle, per the "Global mutable state" design note.
//!
//! Device-disaggregated layerwise prefill (`layerwise_prefill_device != 0`,
//! polled via `asyncio.wait_for(..., timeout=0.01)` in the original) and the
//! co-located synchronous path both resolve to one direct call here: device
//! streams and cross-device tensor moves are out of scope, so there is no
//! second device to poll against, and the original's two branches collapse
//! into one without losing the scheduling decision they gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use runner_backend::{AttentionPlanner, DeviceTarget, InferenceBackend};
use runner_common::config::RunnerConfig;
use runner_common::{n_pages, RunnerError};

use crate::kvcache::PagedKVCache;
use crate::request::{async_stream, AsyncStreamReceiver, AsyncStreamSender, DecodeBatch, ReqState, Request, StreamEvent};
use crate::runner::{DecodeRunner, DecodeRunnerOps, PrefillRunner, PrefillRunnerOps, RunnerId};
use crate::sampler::sample_top_k_top_p;

const N_RUNNERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    LPrefilling,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStatus {
    pub id: String,
    pub state_label: &'static str,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cache_hit_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub engine_state: &'static str,
    pub pending: usize,
    pub prefilling: usize,
    pub decoding: usize,
    pub decode_throughput: f64,
    pub busy_kvcache_pages: usize,
    pub capacity_pages: usize,
    pub requests: Vec<RequestStatus>,
}

enum Command {
    Submit { id: String, prompt_ids: Vec<i64>, max_length: usize, max_new_tokens: usize, stream: AsyncStreamSender },
    Cancel { id: String, resp: oneshot::Sender<bool> },
}

/// Caller-facing façade over a running engine. The engine's own state
/// (requests, kvcache, runners) lives entirely inside the task spawned by
/// `boot`; submit/cancel cross into it over an `mpsc` channel rather than
/// through a shared lock, so the hot scheduling loop never contends on a
/// mutex held by request-handling callers.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<EngineStatus>>,
    next_id: Arc<AtomicU64>,
}

impl EngineHandle {
    pub fn submit(&self, prompt_ids: Vec<i64>, max_length: usize, max_new_tokens: usize) -> (String, AsyncStreamReceiver) {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (stream, rx) = async_stream();
        let _ = self.cmd_tx.send(Command::Submit { id: id.clone(), prompt_ids, max_length, max_new_tokens, stream });
        (id, rx)
    }

    pub async fn cancel(&self, id: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Cancel { id: id.into(), resp: tx }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn get_status(&self) -> EngineStatus {
        self.status.lock().unwrap().clone()
    }
}

struct Engine {
    config: RunnerConfig,
    backend: Arc<dyn InferenceBackend>,
    kvcache: PagedKVCache,
    decode_runners: Vec<DecodeRunner>,
    prefill_runner: PrefillRunner,
    lp_runner: Option<PrefillRunner>,
    requests: HashMap<String, Request>,
    order: Vec<String>,
    lp_req_id: Option<String>,
    state: EngineState,
    busy_kvcache_pages: usize,
    decode_throughput: f64,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    status: Arc<Mutex<EngineStatus>>,
}

/// Boots an engine for the given backend/capability planner and returns a
/// handle plus the background task's `JoinHandle`. Grounded on
/// `Engine.boot` + `Engine._start_engine_loop`; model loading and the
/// meta/fork weight dance are out of scope (the `InferenceBackend` already
/// represents a loaded model).
pub fn boot(config: RunnerConfig, backend: Arc<dyn InferenceBackend>, planner: Arc<dyn AttentionPlanner>) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let max_num_pages = config.max_num_pages();
    let kvcache = PagedKVCache::with_capacity(max_num_pages, config.kvcache_page_size);

    let decode_runners = (0..N_RUNNERS).map(|i| DecodeRunner::new(i, backend.clone(), planner.clone(), kvcache.fork())).collect();
    let prefill_runner = PrefillRunner::new(0, backend.clone(), planner.clone(), kvcache.fork());
    let lp_runner = if config.enable_layerwise_prefill {
        Some(PrefillRunner::new(N_RUNNERS, backend.clone(), planner.clone(), kvcache.fork()))
    } else {
        None
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let status = Arc::new(Mutex::new(EngineStatus { engine_state: "RUNNING", ..Default::default() }));

    let engine = Engine {
        config,
        backend,
        kvcache,
        decode_runners,
        prefill_runner,
        lp_runner,
        requests: HashMap::new(),
        order: Vec::new(),
        lp_req_id: None,
        state: EngineState::Running,
        busy_kvcache_pages: 0,
        decode_throughput: 0.0,
        cmd_rx,
        status: status.clone(),
    };

    let join = tokio::spawn(engine.run_engine_loop());
    let handle = EngineHandle { cmd_tx, status, next_id: Arc::new(AtomicU64::new(0)) };
    (handle, join)
}

impl Engine {
    async fn run_engine_loop(mut self) {
        tracing::info!("enter engine loop");
        loop {
            self.drain_commands();

            if self.requests.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            self.handle_finished_reqs();
            self.summarize_kvcache_usage();

            if self.config.enable_layerwise_prefill {
                self.schedule_layerwise_prefill();
                self.handle_layerwise_prefill();
            }

            self.handle_chunked_prefill();

            let mut decoded = 0usize;
            for _ in 0..16 {
                decoded += self.handle_decode_substep();
            }
            if decoded > 0 {
                self.decode_throughput = decoded as f64;
            }

            self.publish_status();
            tokio::task::yield_now().await;
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Submit { id, prompt_ids, max_length, max_new_tokens, stream } => {
                    self.submit(id, prompt_ids, max_length, max_new_tokens, stream);
                }
                Command::Cancel { id, resp } => {
                    let found = self.cancel(&id);
                    let _ = resp.send(found);
                }
            }
        }
    }

    fn submit(&mut self, id: String, prompt_ids: Vec<i64>, max_length: usize, max_new_tokens: usize, stream: AsyncStreamSender) {
        let max_length = max_length.min(self.config.max_length);
        let max_new_tokens = max_new_tokens.min(self.config.max_new_tokens);
        let mut req =
            Request::new(id.clone(), prompt_ids, max_length, max_new_tokens, stream).with_sampling(self.config.top_k, self.config.top_p, self.config.temperature);

        let m = self.kvcache.match_batch(&[req.all_ids[..req.all_length()].to_vec()]).remove(0);
        let hit_tokens = m.matched_len * self.kvcache.page_size();
        req.usage.prompt_tokens = req.all_length();
        req.usage.total_tokens = req.all_length();
        req.usage.cache_hit_tokens = hit_tokens;
        req.matches = Some(m);

        tracing::info!(request_id = %id, hit_tokens, prompt_tokens = req.prompt_length, "new request");

        self.order.push(id.clone());
        self.requests.insert(id, req);
    }

    fn cancel(&mut self, id: &str) -> bool {
        if let Some(req) = self.requests.get_mut(id) {
            tracing::warn!(request_id = %id, "cancelling");
            req.cancel();
            true
        } else {
            tracing::warn!(request_id = %id, "cancel failed: not found");
            false
        }
    }

    fn handle_finished_reqs(&mut self) {
        let mut finished = Vec::new();
        for id in &self.order {
            if let Some(req) = self.requests.get(id) {
                if matches!(req.state, ReqState::Finished | ReqState::Cancelled) {
                    tracing::info!(request_id = %id, stats = %req.stats.pretty_print_str(), "finished/cancelled");
                    finished.push(id.clone());
                }
            }
        }
        for id in &finished {
            self.requests.remove(id);
        }
        self.order.retain(|id| !finished.contains(id));
    }

    fn summarize_kvcache_usage(&mut self) {
        let page_size = self.kvcache.page_size();
        self.busy_kvcache_pages = self
            .requests
            .values()
            .map(|req| match req.state {
                ReqState::LPrefilling | ReqState::Decoding => n_pages(req.all_length(), page_size),
                ReqState::Prefilling => n_pages(req.prefilled_length, page_size),
                _ => 0,
            })
            .sum();
    }

    fn next_layerwise_prefill_req(&mut self) -> Option<String> {
        let page_size = self.kvcache.page_size();
        let thresh = self.config.layerwise_prefill_thresh_len;
        for id in self.order.clone() {
            let req = self.requests.get_mut(&id).unwrap();
            if !matches!(req.state, ReqState::Pending | ReqState::Prefilling) {
                continue;
            }
            if req.matches.is_none() {
                req.matches = Some(self.kvcache.match_batch(&[req.all_ids[..req.prompt_length].to_vec()]).remove(0));
            }
            let matched_len = req.matches.unwrap().matched_len;
            if matched_len * page_size + thresh <= req.prompt_length {
                return Some(id);
            }
        }
        None
    }

    fn schedule_layerwise_prefill(&mut self) {
        if self.lp_req_id.is_some() || self.lp_runner.is_none() {
            return;
        }
        let Some(id) = self.next_layerwise_prefill_req() else { return };

        let page_size = self.kvcache.page_size();
        let req = &self.requests[&id];
        let need = n_pages(req.all_length() - req.prefilled_length, page_size);
        if need + self.busy_kvcache_pages > self.kvcache.page_table().capacity() {
            tracing::warn!(request_id = %id, "no free kvcache, skipping lprefill");
            return;
        }

        self.lp_req_id = Some(id.clone());
        self.requests.get_mut(&id).unwrap().state = ReqState::LPrefilling;
        self.state = EngineState::LPrefilling;
        tracing::debug!(request_id = %id, "layerwise prefilling");
    }

    /// Co-located (`layerwise_prefill_device == 0`) layerwise prefill must
    /// synchronously evict the main model's KV off the device before running
    /// the prefill runner and restore it (then re-warm decode) afterward, per
    /// `_handle_layerwise_prefill`'s `with kvc.to_("cpu"): ... kvc.to_(device)`
    /// bracket. A disaggregated prefill device (`>= 1`) has nothing to evict.
    fn handle_layerwise_prefill(&mut self) {
        let Some(id) = self.lp_req_id.clone() else { return };
        let Some(runner) = self.lp_runner.as_mut() else { return };
        let co_located = self.config.layerwise_prefill_device == 0;
        let storage = self.backend.kv_storage();

        if co_located {
            if let Err(err) = self.kvcache.to_device(storage.as_ref(), DeviceTarget::Host, None) {
                tracing::error!(request_id = %id, %err, "kvcache evict failed");
            }
        }

        let req = self.requests.get_mut(&id).unwrap();
        let result = runner.prefill(req);

        if co_located {
            if let Err(err) = self.kvcache.to_device(storage.as_ref(), DeviceTarget::Device, None) {
                tracing::error!(request_id = %id, %err, "kvcache restore failed");
            }
            for r in &self.decode_runners {
                r.warmup();
            }
        }

        let logits = match result {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(request_id = %id, %err, "layerwise prefill failed");
                self.lp_req_id = None;
                self.state = EngineState::Running;
                return;
            }
        };
        let eos = self.backend.eos_token();
        let req = self.requests.get_mut(&id).unwrap();
        let (token, stop) = sample_and_record(req, &logits, self.backend.as_ref());
        req.on_prefill_done();
        if stop {
            req.on_decode_done(if token == eos { "stop" } else { "length" });
        }
        self.lp_req_id = None;
        self.state = EngineState::Running;
    }

    fn next_chunked_prefill_req(&mut self) -> Option<String> {
        let page_size = self.kvcache.page_size();
        let chunk_pages = n_pages(self.config.prefill_chunk_size, page_size);
        let thresh = self.config.layerwise_prefill_thresh_len;
        let enable_lp = self.config.enable_layerwise_prefill;
        for id in self.order.clone() {
            let req = self.requests.get_mut(&id).unwrap();
            if !matches!(req.state, ReqState::Pending | ReqState::Prefilling) {
                continue;
            }
            if chunk_pages + self.busy_kvcache_pages > self.kvcache.page_table().capacity() {
                tracing::warn!(request_id = %id, "no free kvcache, skipping chunked prefill");
                continue;
            }
            if req.matches.is_none() {
                req.matches = Some(self.kvcache.match_batch(&[req.all_ids[..req.prompt_length].to_vec()]).remove(0));
            }
            let matched_len = req.matches.unwrap().matched_len;
            if !enable_lp || matched_len * page_size + thresh > req.prompt_length {
                return Some(id);
            }
        }
        None
    }

    fn handle_chunked_prefill(&mut self) {
        let Some(id) = self.next_chunked_prefill_req() else { return };
        self.requests.get_mut(&id).unwrap().state = ReqState::Prefilling;

        if let Some(lp_id) = &self.lp_req_id {
            if lp_id == &id {
                return;
            }
        }

        tracing::debug!(request_id = %id, "prefilling on Rnr#0");
        let chunk_size = self.config.prefill_chunk_size;
        let eos = self.backend.eos_token();
        let req = self.requests.get_mut(&id).unwrap();
        let logits = match self.prefill_runner.prefill_chunk(req, chunk_size) {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(request_id = %id, %err, "chunked prefill failed");
                return;
            }
        };

        let req = self.requests.get_mut(&id).unwrap();
        if req.is_prefill_done() {
            let (token, stop) = sample_and_record(req, &logits, self.backend.as_ref());
            req.on_prefill_done();
            if stop {
                req.on_decode_done(if token == eos { "stop" } else { "length" });
            }
        }
    }

    /// Splits the currently-decoding requests across `N_RUNNERS` batches,
    /// capped to fit both configured batch-size tiers and free KV pages.
    /// Cancels the tail of the FIFO order when over capacity — resolves
    /// spec Open Question #3 by following `_continuous_batching` exactly.
    fn continuous_batching(&mut self) -> Option<Vec<Option<DecodeBatch>>> {
        let mut decode_ids: Vec<String> = self.order.iter().filter(|id| self.requests[*id].state == ReqState::Decoding).cloned().collect();

        if decode_ids.is_empty() {
            return None;
        }

        let max_b = *self.config.batch_sizes_per_runner.last().unwrap_or(&1);
        decode_ids.truncate(max_b * N_RUNNERS);

        let capacity = self.kvcache.page_table().capacity();
        let free_pages = capacity.saturating_sub(self.busy_kvcache_pages).max(1);
        if decode_ids.len() > free_pages {
            for id in &decode_ids[free_pages..] {
                let req = self.requests.get_mut(id).unwrap();
                req.stream.put("\n\nServer is busy (KV cache full), please retry later.");
                req.cancel();
            }
            decode_ids.truncate(free_pages);
        }

        let nreqs = decode_ids.len();
        let mut batches = Vec::with_capacity(N_RUNNERS);
        for ibatch in 0..N_RUNNERS {
            let l = ibatch * nreqs / N_RUNNERS;
            let r = (ibatch + 1) * nreqs / N_RUNNERS;
            if l == r {
                batches.push(None);
                continue;
            }
            let ids = decode_ids[l..r].to_vec();
            let matches = ids.iter().map(|id| self.requests[id].matches.unwrap()).collect();
            let mut batch = DecodeBatch::new(ids, &self.config.batch_sizes_per_runner);
            batch.matches = matches;
            batches.push(Some(batch));
        }
        Some(batches)
    }

    fn handle_decode_substep(&mut self) -> usize {
        let Some(batches) = self.continuous_batching() else { return 0 };

        let mut planned = Vec::with_capacity(N_RUNNERS);
        for (runner, batch) in self.decode_runners.iter_mut().zip(batches.into_iter()) {
            let Some(mut batch) = batch else { continue };
            if let Err(err) = runner.plan_decode1(&mut batch, &mut self.requests) {
                tracing::error!(%err, "decode plan failed");
                continue;
            }
            planned.push((runner.runner_id(), batch));
        }

        let eos = self.backend.eos_token();
        let mut n_decoded = 0;
        for (runner_id, batch) in &planned {
            let runner = self.decode_runners.iter().find(|r| r.runner_id() == *runner_id).unwrap();
            let logits = match runner.decode1(batch, &self.requests) {
                Ok(l) => l,
                Err(err) => {
                    tracing::error!(%err, "decode1 failed");
                    continue;
                }
            };
            for (i, id) in batch.req_ids.iter().enumerate() {
                let req = self.requests.get_mut(id).unwrap();
                let (token, stop) = sample_and_record(req, &logits[i], self.backend.as_ref());
                if stop {
                    req.on_decode_done(if token == eos { "stop" } else { "length" });
                }
                n_decoded += 1;
            }
        }
        n_decoded
    }

    fn publish_status(&self) {
        let mut counters = (0usize, 0usize, 0usize);
        let mut requests = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let req = &self.requests[id];
            let state_label = match req.state {
                ReqState::Pending => {
                    counters.0 += 1;
                    "pending"
                }
                ReqState::Prefilling | ReqState::LPrefilling => {
                    counters.1 += 1;
                    "prefilling"
                }
                ReqState::Decoding => {
                    counters.2 += 1;
                    "decoding"
                }
                ReqState::Finished => "finished",
                ReqState::Cancelled => "cancelled",
            };
            requests.push(RequestStatus {
                id: id.clone(),
                state_label,
                prompt_tokens: req.usage.prompt_tokens,
                completion_tokens: req.usage.completion_tokens,
                cache_hit_tokens: req.usage.cache_hit_tokens,
            });
        }

        let mut status = self.status.lock().unwrap();
        *status = EngineStatus {
            engine_state: match self.state {
                EngineState::Running => "RUNNING",
                EngineState::LPrefilling => "LPREFILLING",
                EngineState::Error => "ERROR",
            },
            pending: counters.0,
            prefilling: counters.1,
            decoding: counters.2,
            decode_throughput: self.decode_throughput,
            busy_kvcache_pages: self.busy_kvcache_pages,
            capacity_pages: self.kvcache.page_table().capacity(),
            requests,
        };
    }
}

/// Samples the next token for `req` off one forward step's logits row and
/// records it, returning `(token, should_stop)`. Grounded on
/// `IOInterface.logits_to_token` + `Request.on_decode1_done`.
fn sample_and_record(req: &mut Request, logits: &[f32], backend: &dyn InferenceBackend) -> (i64, bool) {
    let idx = sample_top_k_top_p::<rand::rngs::StdRng>(logits, req.top_k, req.top_p, req.temperature, None);
    let token = idx as i64;
    let stop = req.record_token(token, backend.eos_token());
    req.stream.put(backend.detokenize(&[token]).unwrap_or_default());
    (token, stop)
}

impl From<RunnerError> for EngineState {
    fn from(_: RunnerError) -> Self {
        EngineState::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::mock::MockBackend;
    use runner_backend::ModelVariant;

    fn planner() -> Arc<dyn AttentionPlanner> {
        struct P;
        impl AttentionPlanner for P {
            fn variant(&self) -> ModelVariant {
                ModelVariant::Gqa
            }
            fn num_qo_heads(&self) -> usize {
                4
            }
            fn num_kv_heads(&self) -> usize {
                4
            }
            fn head_dim_qk(&self) -> usize {
                32
            }
            fn head_dim_vo(&self) -> Option<usize> {
                Some(32)
            }
        }
        Arc::new(P)
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            kvcache_page_size: 4,
            kvcache_num_tokens: 64,
            prefill_chunk_size: 4,
            enable_layerwise_prefill: false,
            batch_sizes_per_runner: vec![1, 2, 4],
            max_new_tokens: 4,
            max_length: 64,
            ..RunnerConfig::default()
        }
    }

    #[tokio::test]
    async fn submit_then_drain_produces_tokens() {
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        let (handle, join) = boot(test_config(), backend, planner());

        let (_id, mut rx) = handle.submit(vec![1, 2, 3], 64, 2);

        let mut saw_done = false;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            while let Ok(ev) = rx.try_recv() {
                if matches!(ev, StreamEvent::Done { .. }) {
                    saw_done = true;
                }
            }
            if saw_done {
                break;
            }
        }
        assert!(saw_done, "request never finished within the step budget");
        join.abort();
    }

    #[tokio::test]
    async fn cancel_marks_request_cancelled() {
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        let (handle, join) = boot(test_config(), backend, planner());

        let (id, _rx) = handle.submit(vec![1, 2], 64, 8);
        tokio::task::yield_now().await;
        let found = handle.cancel(id).await;
        assert!(found);
        join.abort();
    }
}
