//! Per-request state machine, streaming channel, and decode-batch grouping.
//!
//! Grounded on `engine/heyi/utils/request.py` (`Request`, `ReqState`,
//! `AsyncStream`, `DecodeBatch`). `AsyncStream`'s `asyncio.Queue` becomes a
//! `tokio::sync::mpsc` channel.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::prefixtree::Match;
use crate::stats::ReqStats;
use crate::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Pending,
    Prefilling,
    LPrefilling,
    Decoding,
    Finished,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Usage(Usage),
    Done { finish_reason: String },
}

/// Producer half of a request's output stream.
#[derive(Clone)]
pub struct AsyncStreamSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl AsyncStreamSender {
    pub fn put(&self, text: impl Into<String>) {
        let _ = self.tx.send(StreamEvent::Delta(text.into()));
    }

    /// Pushes final usage then a terminal `Done`, matching
    /// `Request.on_decode_done`'s push order.
    pub fn finish(&self, usage: Usage, reason: impl Into<String>) {
        let _ = self.tx.send(StreamEvent::Usage(usage));
        let _ = self.tx.send(StreamEvent::Done { finish_reason: reason.into() });
    }
}

/// Consumer half, handed to the HTTP/SSE/WS layer.
pub struct AsyncStreamReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl AsyncStreamReceiver {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll, used by callers driving their own step loop
    /// instead of awaiting each event (e.g. tests ticking the engine).
    pub fn try_recv(&mut self) -> Result<StreamEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

pub fn async_stream() -> (AsyncStreamSender, AsyncStreamReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AsyncStreamSender { tx }, AsyncStreamReceiver { rx })
}

pub struct Request {
    pub id: String,
    pub all_ids: Vec<i64>,
    pub prompt_length: usize,
    /// How many prompt tokens have been fed through chunked/layerwise
    /// prefill so far — resumes from a cache-hit boundary, not always 0.
    pub prefilled_length: usize,
    pub max_length: usize,
    pub max_new_tokens: usize,
    pub state: ReqState,
    pub matches: Option<Match>,
    pub decode_runner_id: Option<usize>,
    pub stats: ReqStats,
    pub usage: Usage,
    pub stream: AsyncStreamSender,
    /// Per-request logits-processor config, grounded on `Engine.submit`'s
    /// `generation_config` override of the boot-time defaults.
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
}

impl Request {
    pub fn new(id: String, prompt_ids: Vec<i64>, max_length: usize, max_new_tokens: usize, stream: AsyncStreamSender) -> Self {
        let prompt_length = prompt_ids.len();
        let stats = ReqStats::new(); // starts its clock immediately, matching `t_start = time.time()`
        let usage = Usage { prompt_tokens: prompt_length, ..Default::default() };
        Self {
            id,
            all_ids: prompt_ids,
            prompt_length,
            prefilled_length: 0,
            max_length,
            max_new_tokens,
            state: ReqState::Pending,
            matches: None,
            decode_runner_id: None,
            stats,
            usage,
            stream,
            top_k: 40,
            top_p: 0.9,
            temperature: 0.6,
        }
    }

    pub fn with_sampling(mut self, top_k: usize, top_p: f32, temperature: f32) -> Self {
        self.top_k = top_k;
        self.top_p = top_p;
        self.temperature = temperature;
        self
    }

    pub fn all_length(&self) -> usize {
        self.all_ids.len()
    }

    pub fn generated_length(&self) -> usize {
        self.all_length() - self.prompt_length
    }

    pub fn is_prefill_done(&self) -> bool {
        self.prefilled_length >= self.prompt_length
    }

    /// Next chunk of the prompt, `chunk_size` tokens at a time, starting
    /// from wherever prefill (possibly resumed from a cache hit) left off.
    /// Grounded on `decode_runner.py::DecodeRunner.prefill_chunk`.
    pub fn next_chunk(&self, chunk_size: usize) -> (Vec<i64>, Vec<usize>) {
        let start = self.prefilled_length;
        let end = (start + chunk_size).min(self.prompt_length);
        (self.all_ids[start..end].to_vec(), (start..end).collect())
    }

    /// The whole prompt in one shot. Grounded on
    /// `prefill_runner.py::PrefillRunner.prefill`.
    pub fn next_full_prefill(&self) -> (Vec<i64>, Vec<usize>) {
        (self.all_ids[..self.prompt_length].to_vec(), (0..self.prompt_length).collect())
    }

    /// The single most-recent token, for a continuous-batching decode step.
    pub fn next_token(&self) -> (Vec<i64>, Vec<usize>) {
        let pos = self.all_length() - 1;
        (vec![self.all_ids[pos]], vec![pos])
    }

    pub fn on_prefill_chunk_done(&mut self, end: usize) {
        self.prefilled_length = end;
    }

    /// `cache_hit_tokens` is set once at submission time (the engine knows
    /// the page size there); this just flips prefill bookkeeping over to
    /// decode state.
    pub fn on_prefill_done(&mut self) {
        self.stats.on_prefill_done(self.prompt_length);
        self.state = ReqState::Decoding;
    }

    /// Appends a freshly-sampled token and reports whether generation
    /// should stop. Grounded on `Request.on_decode1_done`'s termination
    /// check (`eos` / `max_new_tokens` / `max_length`).
    pub fn record_token(&mut self, token: i64, eos_token: i64) -> bool {
        self.all_ids.push(token);
        self.usage.completion_tokens += 1;
        self.usage.total_tokens = self.usage.prompt_tokens + self.usage.completion_tokens;
        self.stats.on_decode1_done();
        token == eos_token || self.generated_length() >= self.max_new_tokens || self.all_length() >= self.max_length
    }

    pub fn on_decode_done(&mut self, reason: &str) {
        self.state = ReqState::Finished;
        self.stream.finish(self.usage, reason);
    }

    pub fn cancel(&mut self) {
        self.state = ReqState::Cancelled;
        self.stream.finish(self.usage, "cancelled");
    }
}

/// A batch of in-flight decode requests assigned to one decode runner.
/// Grounded on `request.py::DecodeBatch`.
pub struct DecodeBatch {
    pub b: usize,
    pub req_ids: Vec<String>,
    pub matches: Vec<Match>,
    pub decode_runner_id: Option<usize>,
}

impl DecodeBatch {
    /// `b` snaps up to the smallest configured capture size `>= req_ids.len()`,
    /// falling back to the largest configured size if the batch is bigger
    /// than every configured tier. Grounded on the fixed CUDA-graph capture
    /// sizes `DecodeBatch` picks from in `request.py`.
    pub fn new(req_ids: Vec<String>, batch_sizes_per_runner: &[usize]) -> Self {
        let k = req_ids.len();
        let b = batch_sizes_per_runner
            .iter()
            .copied()
            .filter(|&s| s >= k)
            .min()
            .or_else(|| batch_sizes_per_runner.iter().copied().max())
            .unwrap_or(k);
        Self { b, req_ids, matches: Vec::new(), decode_runner_id: None }
    }

    pub fn next_token_inputs(&self, reqs: &HashMap<String, Request>) -> (Vec<i64>, Vec<usize>) {
        let mut input_ids = Vec::with_capacity(self.b);
        let mut cache_position = Vec::with_capacity(self.b);
        for id in &self.req_ids {
            let r = &reqs[id];
            let (tok, pos) = r.next_token();
            input_ids.push(tok[0]);
            cache_position.push(pos[0]);
        }
        (input_ids, cache_position)
    }

    pub fn all_ids<'a>(&self, reqs: &'a HashMap<String, Request>) -> Vec<Vec<i64>> {
        self.req_ids.iter().map(|id| reqs[id].all_ids.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_token_stops_on_eos() {
        let (tx, _rx) = async_stream();
        let mut req = Request::new("r1".into(), vec![1, 2, 3], 100, 50, tx);
        assert!(!req.record_token(9, 99));
        assert!(req.record_token(99, 99));
        assert_eq!(req.generated_length(), 2);
    }

    #[test]
    fn record_token_stops_on_max_new_tokens() {
        let (tx, _rx) = async_stream();
        let mut req = Request::new("r1".into(), vec![1, 2, 3], 100, 2, tx);
        assert!(!req.record_token(5, 99));
        assert!(req.record_token(6, 99));
    }

    #[tokio::test]
    async fn finish_pushes_usage_then_done() {
        let (tx, mut rx) = async_stream();
        let mut req = Request::new("r1".into(), vec![1, 2], 10, 10, tx);
        req.on_decode_done("stop");
        assert!(matches!(rx.recv().await, Some(StreamEvent::Usage(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Done { .. })));
    }
}
