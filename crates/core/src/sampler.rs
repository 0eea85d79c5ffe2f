//! Token sampling over a logits vector.
//!
//! Three strategies, selected per call from the sampler's parameters:
//! greedy argmax when `temperature == 0`, plain multinomial when `topp` is
//! outside `(0, 1)`, and nucleus (top-p) sampling otherwise. The RNG is a
//! 64-bit xorshift*, so a fixed seed reproduces a generation exactly.

use crate::TokenId;

/// One candidate in the top-p scratch buffer.
#[derive(Debug, Clone, Copy)]
struct ProbIndex {
    prob: f32,
    index: TokenId,
}

/// Per-session sampler state.
#[derive(Debug)]
pub struct Sampler {
    temperature: f32,
    topp: f32,
    rng_state: u64,
    /// scratch for top-p candidate sorting, sized to the vocabulary
    probindex: Vec<ProbIndex>,
}

impl Sampler {
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        Self {
            temperature,
            topp,
            rng_state: rng_seed,
            probindex: vec![ProbIndex { prob: 0.0, index: 0 }; vocab_size],
        }
    }

    /// Draw the next token. `logits` is consumed in place: temperature
    /// scaling and the softmax overwrite it.
    ///
    /// The coin is drawn before strategy selection on every call, so the RNG
    /// stream advances identically whatever the parameters.
    pub fn sample(&mut self, logits: &mut [f32]) -> TokenId {
        let coin = random_f32(&mut self.rng_state);

        if self.temperature == 0.0 {
            return sample_argmax(logits);
        }

        for l in logits.iter_mut() {
            *l /= self.temperature;
        }
        crate::kernels::softmax(logits);

        if self.topp <= 0.0 || self.topp >= 1.0 {
            sample_mult(logits, coin)
        } else {
            sample_topp(logits, self.topp, &mut self.probindex, coin)
        }
    }
}

/// Index of the largest logit.
fn sample_argmax(logits: &[f32]) -> TokenId {
    let mut max_i = 0;
    let mut max_p = logits[0];
    for (i, &p) in logits.iter().enumerate().skip(1) {
        if p > max_p {
            max_i = i;
            max_p = p;
        }
    }
    max_i as TokenId
}

/// Inverse-CDF sample from a probability distribution (must sum to 1).
fn sample_mult(probabilities: &[f32], coin: f32) -> TokenId {
    let mut cdf = 0.0f32;
    for (i, &p) in probabilities.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i as TokenId;
        }
    }
    probabilities.len() as TokenId - 1 // in case of rounding errors
}

/// Nucleus sampling: sample from the smallest prefix of the
/// probability-sorted candidates whose cumulative mass exceeds `topp`.
///
/// Values below `(1 - topp) / (n - 1)` can never be part of the nucleus and
/// are dropped before sorting.
fn sample_topp(
    probabilities: &[f32],
    topp: f32,
    probindex: &mut [ProbIndex],
    coin: f32,
) -> TokenId {
    let n = probabilities.len();
    let cutoff = (1.0 - topp) / (n as f32 - 1.0);

    let mut n0 = 0;
    for (i, &p) in probabilities.iter().enumerate() {
        if p >= cutoff {
            probindex[n0] = ProbIndex {
                prob: p,
                index: i as TokenId,
            };
            n0 += 1;
        }
    }

    let candidates = &mut probindex[..n0];
    candidates.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob));

    // truncate where cumulative probability exceeds topp; in case of
    // rounding errors consider all candidates
    let mut cumulative_prob = 0.0f32;
    let mut last_idx = n0 - 1;
    for (i, c) in candidates.iter().enumerate() {
        cumulative_prob += c.prob;
        if cumulative_prob > topp {
            last_idx = i;
            break;
        }
    }

    let r = coin * cumulative_prob;
    let mut cdf = 0.0f32;
    for c in &candidates[..=last_idx] {
        cdf += c.prob;
        if r < cdf {
            return c.index;
        }
    }

    candidates[last_idx].index
}

fn rotate(state: &mut u64) -> u64 {
    *state ^= *state >> 12;
    *state ^= *state << 25;
    *state ^= *state >> 27;
    *state
}

/// xorshift* output step.
pub fn random_u32(state: &mut u64) -> u32 {
    (rotate(state).wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
}

/// Uniform float in `[0, 1)` from the top 24 bits of the generator.
pub fn random_f32(state: &mut u64) -> f32 {
    (random_u32(state) >> 8) as f32 / 16_777_216.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_largest_logit() {
        let mut logits = [0.1f32, 0.9, 0.5];
        let mut s = Sampler::new(3, 0.0, 0.9, 42);
        assert_eq!(s.sample(&mut logits), 1);
    }

    #[test]
    fn argmax_is_seed_independent() {
        for seed in [1u64, 7, 0xdead_beef] {
            let mut logits = [-1.0f32, 3.0, 2.9, 0.0];
            let mut s = Sampler::new(4, 0.0, 0.9, seed);
            assert_eq!(s.sample(&mut logits), 1);
        }
    }

    #[test]
    fn multinomial_uniform_thirds() {
        // softmax of equal logits is [1/3, 1/3, 1/3]; coin 0.5 lands in the
        // second bucket
        let probs = [1.0 / 3.0; 3];
        assert_eq!(sample_mult(&probs, 0.5), 1);
    }

    #[test]
    fn multinomial_rounding_guard_returns_last() {
        let probs = [0.5f32, 0.5];
        assert_eq!(sample_mult(&probs, 1.0), 1);
    }

    #[test]
    fn nucleus_truncates_and_rescales() {
        // cutoff (1 - 0.79) / 3 = 0.07 drops the 0.05 tail; the sorted
        // cumulative mass first exceeds 0.79 at the second candidate, so the
        // nucleus is {0, 1} with mass 0.8; coin 0.9 scales to r = 0.72,
        // which falls in candidate 1's interval [0.5, 0.8)
        let probs = [0.5f32, 0.3, 0.15, 0.05];
        let mut scratch = vec![ProbIndex { prob: 0.0, index: 0 }; 4];
        assert_eq!(sample_topp(&probs, 0.79, &mut scratch, 0.9), 1);
    }

    #[test]
    fn nucleus_rounding_guard_returns_last_candidate() {
        let probs = [0.6f32, 0.4];
        let mut scratch = vec![ProbIndex { prob: 0.0, index: 0 }; 2];
        // coin 1.0 never satisfies r < cdf exactly at the end
        assert_eq!(sample_topp(&probs, 0.5, &mut scratch, 1.0), 0);
    }

    #[test]
    fn rng_stream_is_deterministic() {
        let mut a = 1234u64;
        let mut b = 1234u64;
        for _ in 0..64 {
            assert_eq!(random_u32(&mut a), random_u32(&mut b));
        }
        let f = random_f32(&mut a);
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn sample_streams_identical_for_same_seed() {
        let logits: Vec<f32> = (0..16).map(|i| ((i * 7) % 5) as f32 / 2.0).collect();
        let mut s1 = Sampler::new(16, 0.8, 0.9, 99);
        let mut s2 = Sampler::new(16, 0.8, 0.9, 99);
        for _ in 0..32 {
            let mut l1 = logits.clone();
            let mut l2 = logits.clone();
            assert_eq!(s1.sample(&mut l1), s2.sample(&mut l2));
        }
    }
}
