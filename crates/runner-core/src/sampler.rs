//! Logits-processor pipeline: Temperature -> TopK -> Softmax -> TopP ->
//! Sample, with an argmax shortcut at `temperature == 0`.
//!
//! Grounded on `engine.py::prepare_logits_processor`.

use rand::prelude::*;

/// Samples a token index from `logits` using the same processor order the
/// original engine composes per request: scale by temperature, keep the
/// top `top_k` logits, softmax, restrict to the smallest top-p nucleus,
/// renormalize, sample. `temperature == 0` always returns the argmax,
/// bypassing randomness entirely (a deterministic/greedy decode path).
pub fn sample_top_k_top_p<R: Rng + ?Sized>(
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
    seed: Option<u64>,
) -> usize {
    if logits.is_empty() {
        return 0;
    }

    if temperature == 0.0 {
        return argmax(logits);
    }

    let mut rng: StdRng = match seed {
        Some(s) => SeedableRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let mut pairs: Vec<(usize, f32)> = logits.iter().enumerate().map(|(i, &l)| (i, l / temperature)).collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let cutoff = if top_k > 0 { pairs.len().min(top_k) } else { pairs.len() };

    let mut sum = 0.0_f32;
    let mut probs: Vec<(usize, f32)> = Vec::with_capacity(cutoff);
    for &(i, l) in &pairs[..cutoff] {
        let p = l.exp();
        probs.push((i, p));
        sum += p;
    }
    for p in &mut probs {
        p.1 /= sum.max(1e-9);
    }

    if top_p < 1.0 {
        probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let mut acc = 0.0_f32;
        let mut keep = 0;
        for &(_, p) in &probs {
            acc += p;
            keep += 1;
            if acc >= top_p {
                break;
            }
        }
        probs.truncate(keep.max(1));
        let z: f32 = probs.iter().map(|p| p.1).sum();
        for p in &mut probs {
            p.1 /= z.max(1e-9);
        }
    }

    let r: f32 = rng.gen();
    let mut acc = 0.0_f32;
    for (i, p) in &probs {
        acc += p;
        if r <= acc {
            return *i;
        }
    }
    probs.last().map(|p| p.0).unwrap_or(pairs[0].0)
}

fn argmax(logits: &[f32]) -> usize {
    let mut best_i = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best_i = i;
        }
    }
    best_i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_argmax_regardless_of_seed() {
        let logits = vec![0.1, 5.0, 0.3, 0.2];
        assert_eq!(sample_top_k_top_p::<StdRng>(&logits, 40, 0.9, 0.0, Some(1)), 1);
        assert_eq!(sample_top_k_top_p::<StdRng>(&logits, 40, 0.9, 0.0, None), 1);
    }

    #[test]
    fn sample_is_deterministic_with_seed() {
        let logits = vec![0.1, 0.2, 0.3, 0.4];
        let a = sample_top_k_top_p::<StdRng>(&logits, 0, 1.0, 1.0, Some(42));
        let b = sample_top_k_top_p::<StdRng>(&logits, 0, 1.0, 1.0, Some(42));
        assert_eq!(a, b);
    }
}
