use std::time::{Duration, Instant};

use super::{CacheState, Distribution, ForwardPass};
use crate::error::{Error, Result};
use crate::tokens::{Token, TokenRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    /// Cache valid for the whole buffer of this length.
    Warm(usize),
    Truncating,
    Rebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPolicy {
    pub limit: usize,
    pub truncation_fraction: f64,
    pub retain_structural: bool,
}

impl WindowPolicy {
    /// Tokens discarded from the head on every flush: `ceil(f * W)`.
    pub fn drop_count(&self) -> usize {
        (self.truncation_fraction * self.limit as f64).ceil() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush {
    pub dropped: usize,
    pub retained: usize,
    pub epoch: u64,
}

/// Generated tokens decoded on a private copy of the cache. Nothing here is
/// part of the context until [`ContextWindow::commit`] accepts it.
#[derive(Debug, Clone)]
pub struct Speculation<C> {
    base_epoch: u64,
    base_len: usize,
    tokens: Vec<Token>,
    next: Distribution,
    cache: C,
}

impl<C> Speculation<C> {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn distribution(&self) -> &Distribution {
        &self.next
    }

    pub fn step<M>(&mut self, model: &mut M, token: Token, budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        let started = Instant::now();
        let (next, cache) = model.decode(token, &self.cache)?;
        within_budget(started, budget)?;
        self.tokens.push(token);
        self.next = next;
        self.cache = cache;
        Ok(())
    }
}

/// The token buffer and the model cache derived from it.
///
/// The cache always covers exactly the committed buffer. Appends extend it
/// one decode step per token; an append that would pass the limit first
/// drops the oldest tokens and rebuilds the cache from position 0, because
/// every surviving token has moved to a new absolute position.
pub struct ContextWindow<C> {
    policy: WindowPolicy,
    tokens: Vec<Token>,
    cache: Option<CacheState<C>>,
    next: Option<Distribution>,
    state: WindowState,
    epoch: u64,
    last_flush: Option<Flush>,
}

impl<C: Clone> ContextWindow<C> {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            tokens: Vec::with_capacity(policy.limit),
            cache: None,
            next: None,
            state: WindowState::Empty,
            epoch: 0,
            last_flush: None,
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cache(&self) -> Option<&CacheState<C>> {
        self.cache.as_ref()
    }

    pub fn next_distribution(&self) -> Option<&Distribution> {
        self.next.as_ref()
    }

    /// Takes the record of the most recent flush, if any happened since the
    /// last call.
    pub fn take_flush(&mut self) -> Option<Flush> {
        self.last_flush.take()
    }

    pub fn is_coherent(&self) -> bool {
        match (&self.cache, self.state) {
            (Some(cache), WindowState::Warm(n)) => {
                n == self.tokens.len() && cache.valid_len == n && cache.epoch == self.epoch
            }
            (None, WindowState::Empty) => self.tokens.is_empty(),
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.tokens.clear();
        self.cache = None;
        self.next = None;
        self.state = WindowState::Empty;
    }

    pub fn append<M>(&mut self, model: &mut M, token: Token, budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        self.append_frame(model, &[token], budget)
    }

    /// Appends all of `frame` or none of it.
    pub fn append_frame<M>(&mut self, model: &mut M, frame: &[Token], budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        if frame.is_empty() {
            return Ok(());
        }
        self.reserve(model, frame.len(), budget)?;

        let Some(cache) = &self.cache else {
            return self.cold_start(model, frame, budget);
        };

        let mut step: Option<(Distribution, C)> = None;
        for &token in frame {
            let started = Instant::now();
            let next = match &step {
                Some((_, inner)) => model.decode(token, inner)?,
                None => model.decode(token, &cache.inner)?,
            };
            within_budget(started, budget)?;
            step = Some(next);
        }

        if let Some((next, inner)) = step {
            self.tokens.extend_from_slice(frame);
            self.install(next, inner);
        }
        Ok(())
    }

    /// Makes room for `needed` more tokens, flushing if the buffer would
    /// otherwise pass the limit.
    pub fn reserve<M>(&mut self, model: &mut M, needed: usize, budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        if needed > self.policy.limit {
            return Err(Error::Config(format!(
                "{needed} tokens cannot fit a window of {}",
                self.policy.limit
            )));
        }
        if self.tokens.len() + needed <= self.policy.limit {
            return Ok(());
        }
        self.flush(model, needed, budget)
    }

    pub fn speculate(&self) -> Option<Speculation<C>> {
        let cache = self.cache.as_ref()?;
        let next = self.next.clone()?;
        Some(Speculation {
            base_epoch: self.epoch,
            base_len: self.tokens.len(),
            tokens: Vec::new(),
            next,
            cache: cache.inner.clone(),
        })
    }

    /// Adopts a speculation if the window has not changed since it began and
    /// it still fits. Returns whether it was committed.
    pub fn commit(&mut self, speculation: Speculation<C>) -> bool {
        let current = speculation.base_epoch == self.epoch
            && speculation.base_len == self.tokens.len()
            && self.state == WindowState::Warm(self.tokens.len());
        if !current || self.tokens.len() + speculation.len() > self.policy.limit {
            return false;
        }
        if speculation.is_empty() {
            return true;
        }
        self.tokens.extend_from_slice(&speculation.tokens);
        self.install(speculation.next, speculation.cache);
        true
    }

    fn cold_start<M>(&mut self, model: &mut M, frame: &[Token], budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        let started = Instant::now();
        let (next, inner) = model.prefill(frame)?;
        within_budget(started, budget)?;
        self.tokens.extend_from_slice(frame);
        self.epoch += 1;
        self.install(next, inner);
        Ok(())
    }

    fn install(&mut self, next: Distribution, inner: C) {
        let len = self.tokens.len();
        self.cache = Some(CacheState {
            inner,
            epoch: self.epoch,
            valid_len: len,
        });
        self.next = Some(next);
        self.state = WindowState::Warm(len);
    }

    fn flush<M>(&mut self, model: &mut M, needed: usize, budget: Duration) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        self.state = WindowState::Truncating;

        let header = if self.policy.retain_structural {
            self.tokens
                .iter()
                .take_while(|t| t.role == TokenRole::Structural)
                .count()
        } else {
            0
        };
        let overflow = (self.tokens.len() + needed).saturating_sub(self.policy.limit);
        let dropped = self
            .policy
            .drop_count()
            .max(overflow)
            .min(self.tokens.len() - header);
        self.tokens.drain(header..header + dropped);

        self.state = WindowState::Rebuilding;
        self.cache = None;
        self.next = None;

        if self.tokens.len() + needed > self.policy.limit {
            self.reset();
            return Err(Error::Config(format!(
                "structural header of {header} tokens leaves no room in a window of {}",
                self.policy.limit
            )));
        }

        if self.tokens.is_empty() {
            self.state = WindowState::Empty;
            self.last_flush = Some(Flush {
                dropped,
                retained: 0,
                epoch: self.epoch,
            });
            return Ok(());
        }

        let started = Instant::now();
        let (next, inner) = match model.prefill(&self.tokens) {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                tracing::warn!(error = %e, dropped, "cache rebuild failed, resetting context");
                self.reset();
                return Err(Error::CacheRebuildFailed(e));
            }
        };
        self.epoch += 1;
        self.install(next, inner);

        let flush = Flush {
            dropped,
            retained: self.tokens.len(),
            epoch: self.epoch,
        };
        tracing::debug!(
            dropped = flush.dropped,
            retained = flush.retained,
            epoch = flush.epoch,
            "context flushed"
        );
        self.last_flush = Some(flush);

        // The rebuilt cache is coherent, so it stays even when the rebuild ran
        // long; only the pending append is skipped.
        within_budget(started, budget)
    }
}

fn within_budget(started: Instant, budget: Duration) -> Result<()> {
    let elapsed = started.elapsed();
    if elapsed > budget {
        return Err(Error::LatencyBudgetExceeded { elapsed, budget });
    }
    Ok(())
}
