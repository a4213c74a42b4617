//! Core scheduling, paged KV cache, and sampling.

pub mod kvcache;
pub mod pagetable;
pub mod prefixtree;
pub mod request;
pub mod ring_buffer;
pub mod runner;
pub mod sampler;
pub mod scheduler;
pub mod stats;
pub mod stream_loader;
pub mod usage;

pub use kvcache::{do_page_hash, PagedKVCache, PlanBuffers};
pub use pagetable::{PageId, PageTable};
pub use prefixtree::{Match, NodeId, PrefixTree};
pub use request::{async_stream, AsyncStreamReceiver, AsyncStreamSender, DecodeBatch, ReqState, Request, StreamEvent};
pub use runner::{DecodeRunner, DecodeRunnerOps, PrefillRunner, PrefillRunnerOps, RunnerId};
pub use sampler::sample_top_k_top_p;
pub use scheduler::{boot, EngineHandle, EngineState, EngineStatus, RequestStatus};
pub use stats::{ReqStats, Summary};
pub use usage::Usage;
