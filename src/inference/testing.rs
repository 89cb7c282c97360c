use std::time::Duration;

use super::{Distribution, ForwardPass};
use crate::error::ModelError;
use crate::tokens::{Token, TokenRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionalCache {
    pub hash: u64,
    pub len: usize,
}

/// Deterministic model whose output depends on every token and its
/// absolute position, so a cache built for shifted positions gives a
/// different answer than a cold prefill.
#[derive(Debug, Default)]
pub struct PositionalModel {
    pub vocab: usize,
    pub prefills: usize,
    pub decodes: usize,
    pub fail_prefill: bool,
    pub fail_decode: bool,
    pub decode_delay: Option<Duration>,
    pub prefill_delay: Option<Duration>,
    /// Id given a dominant logit so greedy sampling always picks it.
    pub favored: Option<u32>,
}

impl PositionalModel {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            ..Self::default()
        }
    }

    fn distribution(&self, cache: &PositionalCache) -> Distribution {
        let logits = (0..self.vocab as u64)
            .map(|id| match self.favored {
                Some(favored) if favored as u64 == id => 100.0,
                _ => (mix(cache.hash, cache.len as u64, id) % 1000) as f32 / 100.0,
            })
            .collect();
        Distribution::new(logits)
    }
}

impl ForwardPass for PositionalModel {
    type Cache = PositionalCache;

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn prefill(&mut self, tokens: &[Token]) -> Result<(Distribution, PositionalCache), ModelError> {
        self.prefills += 1;
        if let Some(delay) = self.prefill_delay {
            std::thread::sleep(delay);
        }
        if self.fail_prefill {
            return Err(ModelError::Forward("prefill refused".into()));
        }
        if tokens.is_empty() {
            return Err(ModelError::EmptyPrefill);
        }
        let mut cache = PositionalCache { hash: 0, len: 0 };
        for token in tokens {
            cache = step(cache, token.id);
        }
        Ok((self.distribution(&cache), cache))
    }

    fn decode(
        &mut self,
        token: Token,
        cache: &PositionalCache,
    ) -> Result<(Distribution, PositionalCache), ModelError> {
        self.decodes += 1;
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        if self.fail_decode {
            return Err(ModelError::Forward("decode refused".into()));
        }
        let next = step(*cache, token.id);
        Ok((self.distribution(&next), next))
    }
}

fn step(cache: PositionalCache, id: u32) -> PositionalCache {
    PositionalCache {
        hash: mix(cache.hash, cache.len as u64, id as u64),
        len: cache.len + 1,
    }
}

fn mix(hash: u64, position: u64, id: u64) -> u64 {
    let mut x = hash ^ position.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ id.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    x
}

pub fn event_token(id: u32) -> Token {
    Token {
        id,
        role: TokenRole::Event,
    }
}

pub fn structural_token(id: u32) -> Token {
    Token {
        id,
        role: TokenRole::Structural,
    }
}
