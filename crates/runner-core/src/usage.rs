//! Grounded on `utils/usage.py::Usage`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub completion_tokens: usize,
    pub prompt_tokens: usize,
    pub cache_hit_tokens: usize,
    pub total_tokens: usize,
}
