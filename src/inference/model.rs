use crate::error::ModelError;
use crate::tokens::Token;

/// Next-token scores over the whole vocabulary, indexed by token id.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    logits: Vec<f32>,
}

impl Distribution {
    pub fn new(logits: Vec<f32>) -> Self {
        Self { logits }
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn len(&self) -> usize {
        self.logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }

    /// Highest-scoring id; ties resolve to the lowest id.
    pub fn argmax(&self) -> Option<u32> {
        let mut best: Option<(u32, f32)> = None;
        for (id, &logit) in self.logits.iter().enumerate() {
            if logit.is_nan() {
                continue;
            }
            match best {
                Some((_, score)) if score >= logit => {}
                _ => best = Some((id as u32, logit)),
            }
        }
        best.map(|(id, _)| id)
    }
}

/// The opaque transformer forward pass.
///
/// Implementations must be deterministic: the same tokens (or the same token
/// and cache) always produce the same distribution and cache. Positions are
/// absolute, so a cache is only meaningful for the exact prefix it was built
/// from.
pub trait ForwardPass {
    type Cache: Clone;

    fn vocab_size(&self) -> usize;

    /// Runs the whole sequence from position 0.
    fn prefill(&mut self, tokens: &[Token]) -> Result<(Distribution, Self::Cache), ModelError>;

    /// Runs one token at the position following `cache`. The input cache is
    /// left untouched so a failed or abandoned step costs nothing.
    fn decode(
        &mut self,
        token: Token,
        cache: &Self::Cache,
    ) -> Result<(Distribution, Self::Cache), ModelError>;
}

/// Model cache tagged with the buffer prefix it is valid for.
#[derive(Debug, Clone)]
pub struct CacheState<C> {
    pub inner: C,
    pub epoch: u64,
    pub valid_len: usize,
}
