//! HTTP API: JSON, SSE, and WebSocket front ends over the scheduling engine.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use axum::extract::ws::{Message, WebSocketUpgrade};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, IntCounter, TextEncoder};
use runner_backend::{mock::MockBackend, AttentionPlanner, InferenceBackend, ModelVariant};
use runner_backend_llamacpp::{LlamaCppBackend, LlamaCppPlanner};
use runner_core::{EngineHandle, EngineStatus, StreamEvent};
use runner_common::config::RunnerConfig;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};
use runner_obs::{init as obs_init, spawn_gpu_polling};

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn InferenceBackend>,
    engine: EngineHandle,
    config: RunnerConfig,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
    ttft_seconds: Histogram,
    busy_kvcache_pages: prometheus::IntGauge,
    kvcache_capacity_pages: prometheus::IntGauge,
    pending_gauge: prometheus::IntGauge,
    prefilling_gauge: prometheus::IntGauge,
    decoding_gauge: prometheus::IntGauge,
    decode_throughput_gauge: prometheus::Gauge,
    limiter: RateLimiter,
    budgets: TokenBudgets,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

/// GQA fallback planner for the mock/echo backend — there is no real model
/// loaded, so head-shape facts are nominal placeholders good enough to
/// drive the paging math.
struct DefaultPlanner;
impl AttentionPlanner for DefaultPlanner {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Gqa
    }
    fn num_qo_heads(&self) -> usize {
        32
    }
    fn num_kv_heads(&self) -> usize {
        8
    }
    fn head_dim_qk(&self) -> usize {
        128
    }
    fn head_dim_vo(&self) -> Option<usize> {
        Some(128)
    }
}

pub fn app() -> Router {
    let config = RunnerConfig::load();
    let (backend, planner) = select_backend(&config);
    obs_init();
    spawn_gpu_polling();

    let (engine, join) = runner_core::boot(config.clone(), backend.clone(), planner);
    std::mem::forget(join); // engine loop runs for the process lifetime

    let busy_kvcache_pages = prometheus::register_int_gauge!("runner_busy_kvcache_pages", "KV pages currently in use").expect("gauge");
    let kvcache_capacity_pages = prometheus::register_int_gauge!("runner_kvcache_capacity_pages", "Total KV pages available").expect("gauge");
    let pending_gauge = prometheus::register_int_gauge!("runner_requests_pending", "Requests awaiting prefill").expect("gauge");
    let prefilling_gauge = prometheus::register_int_gauge!("runner_requests_prefilling", "Requests currently prefilling").expect("gauge");
    let decoding_gauge = prometheus::register_int_gauge!("runner_requests_decoding", "Requests currently decoding").expect("gauge");
    let decode_throughput_gauge = prometheus::register_gauge!("runner_decode_throughput_tokens_per_sec", "Decode tokens/sec over the last engine tick").expect("gauge");

    let state = AppState {
        backend,
        engine,
        config,
        requests_total: prometheus::register_int_counter!("runner_requests_total", "Total number of /generate requests").expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!("runner_tokens_generated_total", "Total output tokens").expect("counter"),
        ttft_seconds: prometheus::register_histogram!("runner_ttft_seconds", "Time to first token").expect("histogram"),
        busy_kvcache_pages,
        kvcache_capacity_pages,
        pending_gauge,
        prefilling_gauge,
        decoding_gauge,
        decode_throughput_gauge,
        limiter: RateLimiter::new(),
        budgets: TokenBudgets::new(),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/generate", post(generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/sse/generate", get(generate_sse))
        .route("/ws/generate", get(ws_generate))
        .route("/admin/cancel/:id", post(admin_cancel))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

fn select_backend(config: &RunnerConfig) -> (Arc<dyn InferenceBackend>, Arc<dyn AttentionPlanner>) {
    if let Ok(model_path) = std::env::var("RUNNER_MODEL") {
        let llama = LlamaCppBackend::new();
        if llama.load_model(&model_path, runner_backend::LoadParams { n_ctx: config.context_size.unwrap_or(2048), n_gpu_layers: config.gpu_layers.unwrap_or(0) }).is_ok() {
            tracing::info!(target: "api", model = %model_path, "using llama.cpp backend");
            let planner: Arc<dyn AttentionPlanner> = Arc::new(LlamaCppPlanner { num_qo_heads: 32, num_kv_heads: 8, head_dim: 128 });
            return (Arc::new(llama), planner);
        }
        tracing::warn!(target: "api", "failed to init llama backend, falling back to mock");
    }
    (Arc::new(MockBackend::new()), Arc::new(DefaultPlanner))
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.get_status();
    if status.engine_state == "ERROR" {
        ([("content-type", "text/plain")], "not-ready")
    } else {
        ([("content-type", "text/plain")], "ready")
    }
}

async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    let status = state.engine.get_status();
    state.busy_kvcache_pages.set(status.busy_kvcache_pages as i64);
    state.kvcache_capacity_pages.set(status.capacity_pages as i64);
    state.pending_gauge.set(status.pending as i64);
    state.prefilling_gauge.set(status.prefilling as i64);
    state.decoding_gauge.set(status.decoding as i64);
    state.decode_throughput_gauge.set(status.decode_throughput);
    Json(status)
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct GenerateResponse {
    text: String,
    finish_reason: String,
}

/// Submits a prompt and blocks until the request finishes, collecting every
/// streamed delta into one string. Grounded on the non-streaming half of
/// `engine.py::submit` plus a synchronous drain of its `AsyncStream`.
async fn run_to_completion(state: &AppState, prompt: &str, max_tokens: usize) -> (String, String) {
    let ids = state.backend.tokenize(prompt).unwrap_or_default();
    let (_id, mut rx) = state.engine.submit(ids, state.config.max_length, max_tokens.min(state.config.max_new_tokens));
    let mut text = String::new();
    let mut reason = "stop".to_string();
    while let Some(ev) = rx.recv().await {
        match ev {
            StreamEvent::Delta(piece) => text.push_str(&piece),
            StreamEvent::Usage(_) => {}
            StreamEvent::Done { finish_reason } => {
                reason = finish_reason;
                break;
            }
        }
    }
    (text, reason)
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerateResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(GenerateResponse { text: "RATE_LIMITED".into(), finish_reason: "rate_limited".into() });
    }
    let start = std::time::Instant::now();
    let (text, finish_reason) = run_to_completion(&state, &req.prompt, req.max_tokens.unwrap_or(128)).await;
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    state.tokens_generated_total.inc_by(text.len() as u64);
    state.budgets.record(&tenant_id(), text.len() as u64).await;
    Json(GenerateResponse { text, finish_reason })
}

#[derive(serde::Deserialize)]
struct SseQuery {
    prompt: String,
    max_tokens: Option<usize>,
}

async fn generate_sse(State(state): State<AppState>, Query(q): Query<SseQuery>) -> Sse<impl axum::response::sse::Stream<Item = runner_common::Result<Event>>> {
    state.requests_total.inc();
    let ids = state.backend.tokenize(&q.prompt).unwrap_or_default();
    let (_id, mut stream_rx) = state.engine.submit(ids, state.config.max_length, q.max_tokens.unwrap_or(128).min(state.config.max_new_tokens));
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let start = std::time::Instant::now();
    tokio::spawn(async move {
        while let Some(ev) = stream_rx.recv().await {
            match ev {
                StreamEvent::Delta(piece) => {
                    if tx.send(Ok(Event::default().data(piece))).await.is_err() {
                        break;
                    }
                }
                StreamEvent::Usage(_) => {}
                StreamEvent::Done { .. } => break,
            }
        }
    });
    let stream = ReceiverStream::new(rx).map(|e| e);
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    Sse::new(stream)
}

async fn ws_generate(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let prompt = match socket.recv().await {
            Some(Ok(Message::Text(t))) => t,
            _ => return,
        };
        let ids = state.backend.tokenize(&prompt).unwrap_or_default();
        let (_id, mut rx) = state.engine.submit(ids, state.config.max_length, state.config.max_new_tokens);
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Delta(piece) => {
                    if socket.send(Message::Text(piece)).await.is_err() {
                        return;
                    }
                }
                StreamEvent::Usage(_) => {}
                StreamEvent::Done { .. } => break,
            }
        }
        let _ = socket.close().await;
    })
}

async fn openapi() -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": "MoE Inference Runner API", "version": "0.1.0"},
        "paths": {
            "/generate": {"post": {"summary": "Generate text"}},
            "/v1/chat/completions": {"post": {"summary": "OpenAI chat subset"}},
            "/sse/generate": {"get": {"summary": "SSE token stream"}},
            "/ws/generate": {"get": {"summary": "WebSocket token stream"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/status": {"get": {"summary": "Engine scheduling status"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}},
            "/admin/cancel/:id": {"post": {"summary": "Cancel an in-flight request"}}
        }
    });
    Json(spec)
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatRequest {
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[allow(dead_code)]
    stream: Option<bool>,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct ChatChoiceMessage {
    role: String,
    content: String,
}

#[derive(serde::Serialize)]
struct ChatChoice {
    index: u32,
    message: ChatChoiceMessage,
    finish_reason: String,
}

#[derive(serde::Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    choices: Vec<ChatChoice>,
}

async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(ChatResponse {
            id: "rate-limited".into(),
            object: "chat.completion".into(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatChoiceMessage { role: "assistant".into(), content: "RATE_LIMITED".into() },
                finish_reason: "stop".into(),
            }],
        });
    }
    let mut prompt = String::new();
    for m in &req.messages {
        if m.role == "system" || m.role == "user" {
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    let (text, finish_reason) = run_to_completion(&state, &prompt, req.max_tokens.unwrap_or(128)).await;
    Json(ChatResponse {
        id: "chatcmpl-1".into(),
        object: "chat.completion".into(),
        choices: vec![ChatChoice { index: 0, message: ChatChoiceMessage { role: "assistant".into(), content: text }, finish_reason }],
    })
}

async fn admin_cancel(State(state): State<AppState>, axum::extract::Path(id): axum::extract::Path<String>) -> impl IntoResponse {
    let found = state.engine.cancel(id).await;
    ([("content-type", "text/plain")], if found { "cancelled" } else { "not-found" })
}

fn tenant_id() -> String {
    "default".into()
}

use std::collections::HashMap;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
struct RateLimiter {
    inner: Arc<AsyncMutex<HashMap<String, (u64, std::time::Instant)>>>,
}
impl RateLimiter {
    fn new() -> Self {
        Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) }
    }
    async fn check_allow(&self, key: &str) -> bool {
        let mut g = self.inner.lock().await;
        let entry = g.entry(key.to_string()).or_insert((0, std::time::Instant::now()));
        if entry.1.elapsed() > std::time::Duration::from_secs(60) {
            *entry = (0, std::time::Instant::now());
        }
        let limit: u64 = std::env::var("RUNNER_RATE_LIMIT_PER_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(600);
        if entry.0 >= limit {
            return false;
        }
        entry.0 += 1;
        true
    }
}

#[derive(Clone)]
struct TokenBudgets {
    inner: Arc<AsyncMutex<HashMap<String, u64>>>,
}
impl TokenBudgets {
    fn new() -> Self {
        Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) }
    }
    async fn record(&self, key: &str, tokens: u64) {
        let mut g = self.inner.lock().await;
        let v = g.entry(key.to_string()).or_insert(0);
        *v += tokens;
    }
}
