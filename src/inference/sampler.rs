use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::Distribution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// `<= 0.0` selects greedy decoding.
    pub temperature: f32,
    /// 0 keeps every candidate.
    pub top_k: usize,
    /// Fixed seed for reproducible sessions.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_k: 24,
            seed: None,
        }
    }
}

pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn sample(&mut self, dist: &Distribution, config: &SamplingConfig) -> Option<u32> {
        if config.temperature <= 0.0 || config.top_k == 1 {
            return dist.argmax();
        }

        let mut candidates: Vec<(u32, f32)> = dist
            .logits()
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(id, &l)| (id as u32, l))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if config.top_k > 0 {
            candidates.truncate(config.top_k);
        }

        let max = candidates[0].1;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|(_, l)| (((l - max) / config.temperature) as f64).exp())
            .collect();
        let total: f64 = weights.iter().sum();

        let mut target = self.rng.r#gen::<f64>() * total;
        for ((id, _), weight) in candidates.iter().zip(&weights) {
            if target < *weight {
                return Some(*id);
            }
            target -= weight;
        }
        candidates.last().map(|(id, _)| *id)
    }
}
