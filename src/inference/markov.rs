use std::collections::HashMap;
use std::sync::Arc;

use super::{Distribution, ForwardPass};
use crate::error::ModelError;
use crate::tokens::{Symbol, Token, Vocabulary};

const GRAMMAR_PRIOR: f32 = 1.0;
const OFF_GRAMMAR_PRIOR: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Grid,
    Offset,
    Channel,
    NoteOn,
    NoteOff,
    Velocity,
    Structural,
}

impl Class {
    fn of(symbol: &Symbol) -> Self {
        match symbol {
            Symbol::Grid(_) => Class::Grid,
            Symbol::Offset(_) => Class::Offset,
            Symbol::Channel(_) => Class::Channel,
            Symbol::NoteOn(_) => Class::NoteOn,
            Symbol::NoteOff(_) => Class::NoteOff,
            Symbol::Velocity(_) => Class::Velocity,
            Symbol::Structural(_) => Class::Structural,
        }
    }

    fn follows(self, previous: Option<Class>) -> bool {
        match previous {
            None | Some(Class::Velocity | Class::NoteOff | Class::Structural) => self == Class::Grid,
            Some(Class::Grid) => self == Class::Offset,
            Some(Class::Offset) => self == Class::Channel,
            Some(Class::Channel) => matches!(self, Class::NoteOn | Class::NoteOff),
            Some(Class::NoteOn) => self == Class::Velocity,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkovCache {
    last: Option<u32>,
    transitions: HashMap<(u32, u32), u32>,
}

/// Count-based stand-in for a transformer.
///
/// The cache holds transition counts over the context, so the model echoes
/// the material it has heard while a frame-grammar prior keeps its output
/// decodable. It has no positional state, which makes it a convenient
/// default when no external model is wired in.
#[derive(Debug, Clone)]
pub struct MarkovModel {
    classes: Vec<Class>,
}

impl MarkovModel {
    pub fn new(vocab: &Arc<Vocabulary>) -> Self {
        let classes = (0..vocab.len() as u32)
            .filter_map(|id| vocab.symbol(id).map(Class::of))
            .collect();
        Self { classes }
    }

    fn check(&self, token: Token) -> Result<(), ModelError> {
        if token.id as usize >= self.classes.len() {
            return Err(ModelError::TokenOutOfRange {
                id: token.id,
                size: self.classes.len(),
            });
        }
        Ok(())
    }

    fn distribution(&self, cache: &MarkovCache) -> Distribution {
        let previous = cache.last.map(|id| self.classes[id as usize]);
        let logits = self
            .classes
            .iter()
            .enumerate()
            .map(|(next, class)| {
                let prior = if class.follows(previous) {
                    GRAMMAR_PRIOR
                } else {
                    OFF_GRAMMAR_PRIOR
                };
                let count = cache
                    .last
                    .and_then(|last| cache.transitions.get(&(last, next as u32)))
                    .copied()
                    .unwrap_or(0);
                (prior + count as f32).ln()
            })
            .collect();
        Distribution::new(logits)
    }
}

impl ForwardPass for MarkovModel {
    type Cache = MarkovCache;

    fn vocab_size(&self) -> usize {
        self.classes.len()
    }

    fn prefill(&mut self, tokens: &[Token]) -> Result<(Distribution, MarkovCache), ModelError> {
        if tokens.is_empty() {
            return Err(ModelError::EmptyPrefill);
        }
        let mut cache = MarkovCache::default();
        for token in tokens {
            self.check(*token)?;
            observe(&mut cache, token.id);
        }
        Ok((self.distribution(&cache), cache))
    }

    fn decode(
        &mut self,
        token: Token,
        cache: &MarkovCache,
    ) -> Result<(Distribution, MarkovCache), ModelError> {
        self.check(token)?;
        let mut next = cache.clone();
        observe(&mut next, token.id);
        Ok((self.distribution(&next), next))
    }
}

fn observe(cache: &mut MarkovCache, id: u32) {
    if let Some(last) = cache.last {
        *cache.transitions.entry((last, id)).or_default() += 1;
    }
    cache.last = Some(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CanonicalEvent;
    use crate::tokens::TimeCodec;

    fn setup() -> (Arc<Vocabulary>, MarkovModel) {
        let vocab = Arc::new(Vocabulary::standard(12, 16, &["<bos>"]).unwrap());
        let model = MarkovModel::new(&vocab);
        (vocab, model)
    }

    #[test]
    fn head_matches_vocabulary() {
        let (vocab, model) = setup();
        assert_eq!(model.vocab_size(), vocab.len());
    }

    #[test]
    fn prefill_equals_incremental_decode() {
        let (vocab, mut model) = setup();
        let codec = TimeCodec::new(vocab.clone());
        let mut tokens = codec.encode(&CanonicalEvent::note_on(1, 60, 90, 12)).unwrap();
        tokens.extend(codec.encode(&CanonicalEvent::note_off(1, 60, 24)).unwrap());

        let (cold, _) = model.prefill(&tokens).unwrap();
        let (mut dist, mut cache) = model.prefill(&tokens[..1]).unwrap();
        for token in &tokens[1..] {
            (dist, cache) = model.decode(*token, &cache).unwrap();
        }
        assert_eq!(dist, cold);
    }

    #[test]
    fn greedy_continuation_follows_frame_grammar() {
        let (vocab, mut model) = setup();
        let codec = TimeCodec::new(vocab.clone());
        let tokens = codec.encode(&CanonicalEvent::note_on(2, 64, 100, 0)).unwrap();
        let (mut dist, mut cache) = model.prefill(&tokens).unwrap();

        let mut decoder = codec.decoder();
        let mut event = None;
        for _ in 0..5 {
            let id = dist.argmax().unwrap();
            let token = vocab.token_by_id(id).unwrap();
            event = decoder.feed(token).unwrap();
            if event.is_some() {
                break;
            }
            (dist, cache) = model.decode(token, &cache).unwrap();
        }
        assert!(event.is_some());
    }

    #[test]
    fn rejects_unknown_ids_and_empty_prefill() {
        let (vocab, mut model) = setup();
        assert_eq!(model.prefill(&[]).unwrap_err(), ModelError::EmptyPrefill);
        let bogus = Token {
            id: vocab.len() as u32,
            role: crate::tokens::TokenRole::Event,
        };
        assert!(matches!(
            model.prefill(&[bogus]),
            Err(ModelError::TokenOutOfRange { .. })
        ));
    }
}
