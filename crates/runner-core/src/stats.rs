//! Per-request latency bookkeeping.
//!
//! Grounded on `utils/stats.py::ReqStats` (`on_prefill_done`,
//! `on_decode1_done`, `summarize`, `pretty_print_str`); `time.time()` /
//! numpy percentile math ported to `std::time::Instant` and a plain sort.

use std::time::{Duration, Instant};

pub struct ReqStats {
    t_start: Instant,
    t_prefill_done: Option<Instant>,
    n_prefill_tokens: usize,
    decode_times: Vec<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Summary {
    pub ttft: Duration,
    pub avg_tbt: Duration,
    pub p95_tbt: Duration,
    pub throughput_tokens_per_sec: f64,
    pub completion_tokens: usize,
}

impl ReqStats {
    pub fn new() -> Self {
        Self { t_start: Instant::now(), t_prefill_done: None, n_prefill_tokens: 0, decode_times: Vec::new() }
    }

    pub fn on_prefill_done(&mut self, ntokens: usize) {
        self.t_prefill_done = Some(Instant::now());
        self.n_prefill_tokens = ntokens;
    }

    pub fn on_decode1_done(&mut self) {
        self.decode_times.push(Instant::now());
    }

    pub fn summarize(&self) -> Summary {
        let ttft = self.t_prefill_done.map(|t| t.duration_since(self.t_start)).unwrap_or_default();

        if self.decode_times.len() < 2 {
            return Summary { ttft, completion_tokens: self.decode_times.len(), ..Default::default() };
        }

        let mut intervals: Vec<Duration> = self
            .decode_times
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect();

        let total: Duration = intervals.iter().sum();
        let avg_tbt = total / intervals.len() as u32;

        intervals.sort();
        let idx = ((intervals.len() as f64) * 0.95).ceil() as usize;
        let p95_tbt = intervals[idx.saturating_sub(1).min(intervals.len() - 1)];

        let span = self.decode_times.last().unwrap().duration_since(*self.decode_times.first().unwrap());
        let throughput_tokens_per_sec = if span.as_secs_f64() > 0.0 {
            self.decode_times.len() as f64 / span.as_secs_f64()
        } else {
            0.0
        };

        Summary { ttft, avg_tbt, p95_tbt, throughput_tokens_per_sec, completion_tokens: self.decode_times.len() }
    }

    pub fn pretty_print_str(&self) -> String {
        let s = self.summarize();
        format!(
            "ttft={:.3}s avg_tbt={:.3}s p95_tbt={:.3}s throughput={:.1}tok/s completion_tokens={} prefill_tokens={}",
            s.ttft.as_secs_f64(),
            s.avg_tbt.as_secs_f64(),
            s.p95_tbt.as_secs_f64(),
            s.throughput_tokens_per_sec,
            s.completion_tokens,
            self.n_prefill_tokens,
        )
    }
}

impl Default for ReqStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn summarize_handles_fewer_than_two_decode_steps() {
        let mut stats = ReqStats::new();
        stats.on_prefill_done(10);
        let s = stats.summarize();
        assert_eq!(s.completion_tokens, 0);
    }

    #[test]
    fn summarize_computes_positive_throughput_with_steps() {
        let mut stats = ReqStats::new();
        stats.on_prefill_done(10);
        for _ in 0..4 {
            sleep(Duration::from_millis(1));
            stats.on_decode1_done();
        }
        let s = stats.summarize();
        assert_eq!(s.completion_tokens, 4);
        assert!(s.throughput_tokens_per_sec > 0.0);
    }
}
