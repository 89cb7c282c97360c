use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::inference::{ContextWindow, ForwardPass};
use crate::tokens::{Symbol, Token, Vocabulary};

/// The one live generation context of the process.
///
/// Built once at startup and handed by reference to whatever needs it; the
/// compute thread is its only mutator.
pub struct GenerationSession<C> {
    pub window: ContextWindow<C>,
    header: Vec<Token>,
    timeline_tick: u64,
    latency_budget: Duration,
}

impl<C: Clone> GenerationSession<C> {
    pub fn new(config: &RuntimeConfig, vocab: &Vocabulary) -> Result<Self> {
        let header = config
            .header
            .iter()
            .map(|name| {
                vocab
                    .token(&Symbol::Structural(name.clone()))
                    .ok_or_else(|| Error::Config(format!("header symbol '{name}' is not in the vocabulary")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            window: ContextWindow::new(config.window_policy()),
            header,
            timeline_tick: 0,
            latency_budget: config.latency_budget(),
        })
    }

    pub fn header(&self) -> &[Token] {
        &self.header
    }

    pub fn latency_budget(&self) -> Duration {
        self.latency_budget
    }

    /// Tick of the most recent event in the context.
    pub fn timeline_tick(&self) -> u64 {
        self.timeline_tick
    }

    pub fn advance_timeline(&mut self, tick: u64) {
        self.timeline_tick = self.timeline_tick.max(tick);
    }

    /// Places the header at position 0 of an empty context.
    pub fn seed<M>(&mut self, model: &mut M) -> Result<()>
    where
        M: ForwardPass<Cache = C>,
    {
        if !self.window.is_empty() || self.header.is_empty() {
            return Ok(());
        }
        let header = self.header.clone();
        self.window.append_frame(model, &header, self.latency_budget)
    }

    pub fn reset(&mut self) {
        self.window.reset();
    }
}
