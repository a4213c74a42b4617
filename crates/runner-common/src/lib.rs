pub type Result<T> = core::result::Result<T, RunnerError>;

/// Error taxonomy for the serving core. Variants line up with the recovery
/// classes used by the scheduler: some are recovered locally, some are
/// rejected straight back to the caller, and `CacheIntegrityViolation` is
/// never recovered from.
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("not implemented")]
    NotImplemented,
    #[error("{0}")]
    Message(String),

    #[error("capacity exceeded: requested {requested} pages, {available} available")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("server is busy")]
    ServerBusy,

    #[error("unsupported model type: {0}")]
    UnsupportedModel(String),

    #[error("invalid generation config: {0}")]
    InvalidGenerationConfig(String),

    #[error("kernel failure: {0}")]
    KernelFailure(String),

    #[error("kv-cache integrity violation: {0}")]
    CacheIntegrityViolation(String),

    #[error("request not found: {0}")]
    RequestNotFound(String),
}

/// Ceiling-divides a token count into page count. Grounded on
/// `utils/kvcache/kvcache.py::n_pages`.
pub fn n_pages(n_tokens: usize, page_size: usize) -> usize {
    (n_tokens + page_size - 1) / page_size
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    /// Mirrors `engine/heyi/config.py::Config`, minus the singleton
    /// plumbing — an `Engine` here owns its config explicitly.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct RunnerConfig {
        pub model_dir: PathBuf,
        pub context_size: Option<usize>,
        pub gpu_layers: Option<usize>,
        pub scheduler_tick_ms: Option<u64>,
        pub max_batch_tokens: Option<usize>,

        pub num_cpu_threads: usize,
        pub log_dir: PathBuf,
        pub log_file: String,
        pub log_level: String,
        pub backup_count: u32,

        pub use_cuda_graph: bool,
        pub batch_sizes_per_runner: Vec<usize>,
        pub max_batch_size: usize,
        pub max_length: usize,
        pub max_new_tokens: usize,
        pub prefill_chunk_size: usize,

        pub enable_layerwise_prefill: bool,
        pub layerwise_prefill_device: usize,
        pub layerwise_prefill_thresh_len: usize,

        pub kvcache_page_size: usize,
        pub kvcache_num_tokens: usize,

        pub top_k: usize,
        pub top_p: f32,
        pub temperature: f32,

        pub host: String,
        pub port: u16,

        pub model_name: String,
        pub api_key: String,
        pub trust_remote_code: bool,

        pub thinking: bool,
    }

    impl Default for RunnerConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                context_size: Some(2048),
                gpu_layers: None,
                scheduler_tick_ms: Some(2),
                max_batch_tokens: Some(1024),

                num_cpu_threads: 49,
                log_dir: PathBuf::from("logs"),
                log_file: "runner.log".to_string(),
                log_level: "info".to_string(),
                backup_count: 20,

                use_cuda_graph: true,
                batch_sizes_per_runner: vec![1, 2, 3],
                max_batch_size: 32,
                max_length: 130_000,
                max_new_tokens: 130_000,
                prefill_chunk_size: 128,

                enable_layerwise_prefill: true,
                layerwise_prefill_device: 0,
                layerwise_prefill_thresh_len: 4096,

                kvcache_page_size: 64,
                kvcache_num_tokens: 150_000,

                top_k: 40,
                top_p: 0.9,
                temperature: 0.6,

                host: "0.0.0.0".to_string(),
                port: 10814,

                model_name: String::new(),
                api_key: String::new(),
                trust_remote_code: true,

                thinking: false,
            }
        }
    }

    impl RunnerConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("RUNNER_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<RunnerConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("RUNNER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("RUNNER_CONTEXT_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.context_size = Some(v); }
            if let Some(v) = env::var("RUNNER_GPU_LAYERS").ok().and_then(|v| v.parse().ok()) { cfg.gpu_layers = Some(v); }
            if let Some(v) = env::var("RUNNER_TICK_MS").ok().and_then(|v| v.parse().ok()) { cfg.scheduler_tick_ms = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) { cfg.max_batch_tokens = Some(v); }
            if let Some(v) = env::var("RUNNER_KVCACHE_PAGE_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.kvcache_page_size = v; }
            if let Some(v) = env::var("RUNNER_KVCACHE_NUM_TOKENS").ok().and_then(|v| v.parse().ok()) { cfg.kvcache_num_tokens = v; }
            if let Some(v) = env::var("RUNNER_LAYERWISE_PREFILL_THRESH_LEN").ok().and_then(|v| v.parse().ok()) { cfg.layerwise_prefill_thresh_len = v; }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.max_batch_size = v; }
            if let Ok(v) = env::var("RUNNER_MODEL_NAME") { cfg.model_name = v; }
            if let Ok(v) = env::var("RUNNER_API_KEY") { cfg.api_key = v; }
            cfg
        }

        pub fn max_num_pages(&self) -> usize {
            crate::n_pages(self.kvcache_num_tokens, self.kvcache_page_size)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_matches_original_engine_constants() {
            let cfg = RunnerConfig::default();
            assert_eq!(cfg.kvcache_page_size, 64);
            assert_eq!(cfg.layerwise_prefill_thresh_len, 4096);
            assert_eq!(cfg.batch_sizes_per_runner, vec![1, 2, 3]);
        }
    }
}
