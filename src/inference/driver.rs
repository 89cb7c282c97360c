use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::channel::Receiver;

use super::{Flush, ForwardPass, Sampler, SamplingConfig, Speculation};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::events::{CanonicalEvent, GeneratedEvent, InputBatch};
use crate::session::GenerationSession;
use crate::tokens::{MAX_FRAME_TOKENS, TimeCodec};

/// Tells the decode loop that live input is waiting.
pub trait InputProbe {
    fn has_pending(&self) -> bool;
}

impl<T> InputProbe for Receiver<T> {
    fn has_pending(&self) -> bool {
        !self.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub max_steps_per_run: usize,
    /// How far generation may run ahead of the live clock.
    pub lookahead_ticks: u64,
}

impl DriverSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_steps_per_run: config.max_steps_per_run,
            lookahead_ticks: config.lookahead_ticks,
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub appended: usize,
    pub flushes: Vec<Flush>,
    pub errors: Vec<Error>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub events: Vec<GeneratedEvent>,
    pub steps: usize,
    pub interrupted: bool,
    pub dropped_frames: usize,
    pub flushes: Vec<Flush>,
    pub errors: Vec<Error>,
}

pub struct InferenceDriver<M: ForwardPass> {
    model: M,
    codec: TimeCodec,
    sampler: Sampler,
    sampling: Arc<ArcSwap<SamplingConfig>>,
    settings: DriverSettings,
}

impl<M: ForwardPass> InferenceDriver<M> {
    /// Fails with `VocabularyMismatch` when the model head and the codec
    /// vocabulary disagree in size.
    pub fn new(
        model: M,
        codec: TimeCodec,
        sampling: Arc<ArcSwap<SamplingConfig>>,
        settings: DriverSettings,
    ) -> Result<Self> {
        codec.vocabulary().check_model(model.vocab_size())?;
        let sampler = Sampler::new(sampling.load().seed);
        Ok(Self {
            model,
            codec,
            sampler,
            sampling,
            settings,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn codec(&self) -> &TimeCodec {
        &self.codec
    }

    /// Appends a batch of live events, one whole frame per event. Each
    /// event's time prefix encodes its distance from the previous event in
    /// the context, generated or live.
    pub fn ingest(
        &mut self,
        session: &mut GenerationSession<M::Cache>,
        batch: &InputBatch,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let budget = session.latency_budget();

        for event in &batch.events {
            // no live frame goes in ahead of the header
            if let Err(e) = session.seed(&mut self.model) {
                report.errors.push(e);
                continue;
            }

            let at = batch.anchor_tick + u64::from(event.delta);
            let gap = u32::try_from(at.saturating_sub(session.timeline_tick())).unwrap_or(u32::MAX);
            let frame = match self.codec.encode(&CanonicalEvent { delta: gap, ..*event }) {
                Ok(frame) => frame,
                Err(e) => {
                    report.errors.push(e);
                    continue;
                }
            };

            let appended = session.window.append_frame(&mut self.model, &frame, budget);
            report.flushes.extend(session.window.take_flush());
            match appended {
                Ok(()) => {
                    session.advance_timeline(at);
                    report.appended += 1;
                }
                Err(e) => report.errors.push(e),
            }
        }
        report
    }

    /// Runs decode steps until the step cap, the lookahead horizon, or
    /// pending live input stops it.
    ///
    /// Tokens accumulate on a speculative copy of the cache and join the
    /// context only as a complete frame, so an interruption never leaves a
    /// partial frame behind.
    pub fn generate(
        &mut self,
        session: &mut GenerationSession<M::Cache>,
        probe: &impl InputProbe,
        live_tick: u64,
    ) -> RunReport {
        let mut report = RunReport::default();
        let sampling = self.sampling.load();
        let budget = session.latency_budget();
        let mut decoder = self.codec.decoder();
        let mut speculation: Option<Speculation<M::Cache>> = None;
        let mut decode_time = Duration::ZERO;
        let mut decoded_steps = 0u32;

        while report.steps < self.settings.max_steps_per_run {
            if probe.has_pending() {
                report.interrupted = true;
                break;
            }

            if speculation.is_none() {
                let horizon = live_tick.saturating_add(self.settings.lookahead_ticks);
                if session.timeline_tick() > horizon {
                    break;
                }
                let reserved = session
                    .window
                    .reserve(&mut self.model, MAX_FRAME_TOKENS, budget);
                report.flushes.extend(session.window.take_flush());
                if let Err(e) = reserved {
                    report.errors.push(e);
                    break;
                }
                let Some(fresh) = session.window.speculate() else {
                    break;
                };
                decoder.reset();
                speculation = Some(fresh);
            }
            let Some(spec) = speculation.as_mut() else {
                break;
            };

            let Some(id) = self.sampler.sample(spec.distribution(), &sampling) else {
                break;
            };
            report.steps += 1;

            let Some(token) = self.codec.vocabulary().token_by_id(id) else {
                report.dropped_frames += 1;
                speculation = None;
                continue;
            };
            let decoded = match decoder.feed(token) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::trace!(error = %e, "generated frame dropped");
                    report.dropped_frames += 1;
                    speculation = None;
                    continue;
                }
            };

            let started = Instant::now();
            let stepped = spec.step(&mut self.model, token, budget);
            decode_time += started.elapsed();
            decoded_steps += 1;
            if let Err(e) = stepped {
                report.errors.push(e);
                break;
            }

            match decoded {
                Some(event) => {
                    let Some(frame) = speculation.take() else {
                        break;
                    };
                    if session.window.commit(frame) {
                        // never schedule into the past of the live clock
                        let tick = (session.timeline_tick() + u64::from(event.delta)).max(live_tick);
                        session.advance_timeline(tick);
                        report.events.push(GeneratedEvent { tick, event });
                    } else {
                        report.dropped_frames += 1;
                    }
                }
                None if spec.len() >= MAX_FRAME_TOKENS => {
                    report.dropped_frames += 1;
                    speculation = None;
                }
                None => {}
            }
        }

        if decoded_steps > 0 {
            tracing::debug!(
                steps = decoded_steps,
                mean_step = ?(decode_time / decoded_steps),
                events = report.events.len(),
                interrupted = report.interrupted,
                "generation run"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::inference::testing::PositionalModel;
    use crate::inference::{MarkovModel, WindowState};
    use crate::tokens::{Symbol, Vocabulary};

    struct PendingAfter {
        checks: Cell<usize>,
        after: usize,
    }

    impl PendingAfter {
        fn new(after: usize) -> Self {
            Self {
                checks: Cell::new(0),
                after,
            }
        }

        fn never() -> Self {
            Self::new(usize::MAX)
        }
    }

    impl InputProbe for PendingAfter {
        fn has_pending(&self) -> bool {
            let n = self.checks.get();
            self.checks.set(n + 1);
            n >= self.after
        }
    }

    fn config(window_limit: usize, header: &[&str]) -> RuntimeConfig {
        let mut config = RuntimeConfig {
            window_limit,
            ticks_per_grid: 12,
            header: header.iter().map(|s| s.to_string()).collect(),
            lookahead_ticks: 10_000,
            ..RuntimeConfig::default()
        };
        config.sampling.temperature = 0.0;
        config
    }

    fn driver<M: ForwardPass>(config: &RuntimeConfig, vocab: &Arc<Vocabulary>, model: M) -> InferenceDriver<M> {
        InferenceDriver::new(
            model,
            TimeCodec::new(vocab.clone()),
            Arc::new(ArcSwap::from_pointee(config.sampling.clone())),
            DriverSettings::from_config(config),
        )
        .unwrap()
    }

    fn batch(anchor_tick: u64, events: &[(u8, u32)]) -> InputBatch {
        InputBatch {
            anchor_tick,
            events: events
                .iter()
                .map(|&(pitch, delta)| CanonicalEvent::note_on(1, pitch, 100, delta))
                .collect(),
        }
    }

    #[test]
    fn rejects_mismatched_model() {
        let config = config(64, &[]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let result = InferenceDriver::new(
            PositionalModel::new(vocab.len() + 1),
            TimeCodec::new(vocab.clone()),
            Arc::new(ArcSwap::from_pointee(SamplingConfig::default())),
            DriverSettings::from_config(&config),
        );
        assert!(matches!(result, Err(Error::VocabularyMismatch { .. })));
    }

    #[test]
    fn live_events_land_as_whole_frames() {
        let config = config(64, &["<bos>"]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, PositionalModel::new(vocab.len()));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();

        let report = driver.ingest(&mut session, &batch(100, &[(60, 0), (64, 12)]));
        assert_eq!(report.appended, 2);
        assert!(report.errors.is_empty());
        assert_eq!(session.window.len(), 1 + 5 + 5);
        assert_eq!(session.timeline_tick(), 112);

        // the second frame encodes the 12-tick gap
        let grid = vocab.symbol(session.window.tokens()[6].id).cloned();
        assert_eq!(grid, Some(Symbol::Grid(1)));
    }

    #[test]
    fn generates_complete_events_after_the_context() {
        let config = config(64, &[]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, MarkovModel::new(&vocab));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 12), (62, 24), (64, 36), (65, 48)]));
        assert_eq!(session.window.len(), 20);

        let report = driver.generate(&mut session, &PendingAfter::never(), 0);
        assert!(!report.interrupted);
        assert_eq!(report.steps, 10);
        assert_eq!(report.dropped_frames, 0);
        let ticks: Vec<u64> = report.events.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![60, 72]);
        assert_eq!(session.window.len(), 30);
        assert!(session.window.is_coherent());
    }

    #[test]
    fn pending_input_interrupts_before_any_step() {
        let config = config(64, &[]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, MarkovModel::new(&vocab));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 0)]));

        let report = driver.generate(&mut session, &PendingAfter::new(0), 0);
        assert!(report.interrupted);
        assert_eq!(report.steps, 0);
        assert_eq!(session.window.len(), 5);
    }

    #[test]
    fn interruption_discards_the_partial_frame() {
        let config = config(64, &[]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut model = PositionalModel::new(vocab.len());
        model.favored = vocab.token(&Symbol::Grid(2)).map(|t| t.id);
        let mut driver = driver(&config, &vocab, model);
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 0)]));

        let report = driver.generate(&mut session, &PendingAfter::new(1), 0);
        assert!(report.interrupted);
        assert_eq!(report.steps, 1);
        assert_eq!(session.window.len(), 5);

        // the live event that caused the interruption goes in whole
        let report = driver.ingest(&mut session, &batch(0, &[(67, 6)]));
        assert_eq!(report.appended, 1);
        assert_eq!(session.window.len(), 10);
        assert!(session.window.is_coherent());
    }

    #[test]
    fn slow_step_abandons_the_run() {
        let mut config = config(64, &[]);
        config.latency_budget_ms = 1;
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut model = PositionalModel::new(vocab.len());
        model.favored = vocab.token(&Symbol::Grid(1)).map(|t| t.id);
        let mut driver = driver(&config, &vocab, model);
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 0)]));
        let before = session.window.tokens().to_vec();

        driver.model_mut().decode_delay = Some(std::time::Duration::from_millis(20));
        let report = driver.generate(&mut session, &PendingAfter::never(), 0);
        assert!(matches!(
            report.errors.as_slice(),
            [Error::LatencyBudgetExceeded { .. }]
        ));
        assert!(report.events.is_empty());
        assert_eq!(session.window.tokens(), before.as_slice());
        assert!(session.window.is_coherent());
    }

    #[test]
    fn stops_at_the_lookahead_horizon() {
        let mut config = config(64, &[]);
        config.lookahead_ticks = 48;
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, MarkovModel::new(&vocab));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(1_000, &[(60, 0)]));

        let report = driver.generate(&mut session, &PendingAfter::never(), 900);
        assert_eq!(report.steps, 0);
        assert!(!report.interrupted);
    }

    #[test]
    fn rebuild_failure_resets_and_recovers() {
        let config = config(21, &["<bos>"]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, PositionalModel::new(vocab.len()));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 0), (62, 12), (64, 24), (65, 36)]));
        assert_eq!(session.window.len(), 21);

        driver.model_mut().fail_prefill = true;
        let report = driver.ingest(&mut session, &batch(36, &[(67, 12)]));
        assert!(matches!(
            report.errors.as_slice(),
            [Error::CacheRebuildFailed(_)]
        ));
        assert_eq!(session.window.state(), WindowState::Empty);

        driver.model_mut().fail_prefill = false;
        let report = driver.ingest(&mut session, &batch(48, &[(69, 12)]));
        assert_eq!(report.appended, 1);
        assert_eq!(session.window.tokens()[0], session.header()[0]);
        assert_eq!(session.window.len(), 6);
    }

    #[test]
    fn failed_header_seed_drops_the_event() {
        let mut config = config(64, &["<bos>"]);
        config.latency_budget_ms = 5;
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, PositionalModel::new(vocab.len()));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();

        driver.model_mut().prefill_delay = Some(std::time::Duration::from_millis(50));
        let report = driver.ingest(&mut session, &batch(0, &[(60, 0)]));
        assert_eq!(report.appended, 0);
        assert!(matches!(
            report.errors.as_slice(),
            [Error::LatencyBudgetExceeded { .. }]
        ));
        assert!(session.window.is_empty());

        driver.model_mut().prefill_delay = None;
        let report = driver.ingest(&mut session, &batch(0, &[(62, 12)]));
        assert_eq!(report.appended, 1);
        assert_eq!(session.window.tokens()[0], session.header()[0]);
        assert_eq!(session.window.len(), 6);
    }

    #[test]
    fn flushes_are_reported() {
        let config = config(21, &["<bos>"]);
        let vocab = Arc::new(config.load_vocabulary().unwrap());
        let mut driver = driver(&config, &vocab, PositionalModel::new(vocab.len()));
        let mut session = GenerationSession::new(&config, &vocab).unwrap();
        driver.ingest(&mut session, &batch(0, &[(60, 0), (62, 12), (64, 24), (65, 36)]));

        let report = driver.ingest(&mut session, &batch(36, &[(67, 12)]));
        assert_eq!(report.appended, 1);
        let flush = report.flushes[0];
        // ceil(0.5 * 21) = 11 tokens go, the header stays
        assert_eq!(flush.dropped, 11);
        assert_eq!(flush.retained, 10);
        assert_eq!(session.window.len(), 15);
        assert!(session.window.is_coherent());
    }
}
