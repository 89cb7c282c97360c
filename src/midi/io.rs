use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use ringbuf::traits::Consumer;

use super::device::InputSource;
use super::router::{ChannelRouter, MidiSink, route_input};
use crate::engine::{EngineCommand, EngineUpdate};
use crate::error::Error;
use crate::events::{InputBatch, MidiMessage};
use crate::timing::{TickClock, canonicalize};

/// The I/O side of the runtime: device input in, scheduled output out.
///
/// Never waits on the compute thread. Everything crossing over goes through
/// channels that are drained without blocking.
pub struct IoLoop<S: MidiSink> {
    sources: Vec<InputSource>,
    clock: TickClock,
    router: ChannelRouter,
    sink: S,
    command_tx: Sender<EngineCommand>,
    update_rx: Receiver<EngineUpdate>,
    tick_counter: Arc<AtomicU64>,
    anchor_tick: u64,
    period: Duration,
}

impl<S: MidiSink> IoLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Vec<InputSource>,
        clock: TickClock,
        router: ChannelRouter,
        sink: S,
        command_tx: Sender<EngineCommand>,
        update_rx: Receiver<EngineUpdate>,
        tick_counter: Arc<AtomicU64>,
        period: Duration,
    ) -> Self {
        Self {
            sources,
            clock,
            router,
            sink,
            command_tx,
            update_rx,
            tick_counter,
            anchor_tick: 0,
            period,
        }
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// One I/O tick.
    pub fn poll(&mut self, now: Instant) {
        self.collect_input();
        self.tick_counter
            .store(self.clock.tick_at(now), Ordering::Relaxed);
        self.drain_updates(now);

        if let Err(e) = self.router.emit_due(now, &mut self.sink) {
            tracing::warn!(error = %e, "MIDI output failed");
        }
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        tracing::info!(period = ?self.period, "I/O loop running");
        while !stop.load(Ordering::Relaxed) {
            self.poll(Instant::now());
            std::thread::sleep(self.period);
        }
        self.shutdown();
    }

    /// Releases sounding notes and stops the engine.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.router.stop_all_notes(&mut self.sink) {
            tracing::warn!(error = %e, "failed to release notes");
        }
        let _ = self.command_tx.send(EngineCommand::Shutdown);
    }

    fn collect_input(&mut self) {
        let mut raw = Vec::new();
        let mut last_tick = self.anchor_tick;

        for source in &mut self.sources {
            while let Some(device) = source.consumer.try_pop() {
                if source.clock {
                    match device.message {
                        MidiMessage::Clock => self.clock.on_clock_pulse(device.at),
                        MidiMessage::Start => {
                            self.clock.on_start(device.at);
                            if let Err(e) = self.router.stop_all_notes(&mut self.sink) {
                                tracing::warn!(error = %e, "failed to release notes on start");
                            }
                            let _ = self.command_tx.send(EngineCommand::Reset);
                        }
                        MidiMessage::Stop => self.clock.on_stop(),
                        MidiMessage::Continue | MidiMessage::Voice { .. } => {}
                    }
                    continue;
                }

                let tick = self.clock.tick_at(device.at);
                let delta = u32::try_from(tick.saturating_sub(self.anchor_tick)).unwrap_or(u32::MAX);
                match route_input(device.message, delta) {
                    Ok(Some(event)) => {
                        last_tick = last_tick.max(tick);
                        raw.push(event);
                    }
                    Ok(None) => {}
                    Err(Error::ReservedChannelViolation { channel }) => {
                        tracing::warn!(port = %source.name, channel, "input on output channel dropped");
                    }
                    Err(e) => tracing::warn!(error = %e, "input dropped"),
                }
            }
        }

        let events = canonicalize(&raw);
        if events.is_empty() {
            return;
        }
        let batch = InputBatch {
            anchor_tick: self.anchor_tick,
            events,
        };
        self.anchor_tick = last_tick;
        if self.command_tx.send(EngineCommand::Input(batch)).is_err() {
            tracing::error!("engine is gone, live input dropped");
        }
    }

    fn drain_updates(&mut self, now: Instant) {
        while let Ok(update) = self.update_rx.try_recv() {
            match update {
                EngineUpdate::Generated(events) => {
                    if let Err(e) = self.router.route_generated(&events, &self.clock, now) {
                        tracing::warn!(error = %e, count = events.len(), "generated events dropped");
                    }
                }
                EngineUpdate::CacheFlushed(flush) => {
                    tracing::info!(
                        dropped = flush.dropped,
                        retained = flush.retained,
                        epoch = flush.epoch,
                        "context window flushed"
                    );
                }
                EngineUpdate::Error { message } => tracing::warn!("{message}"),
            }
        }
    }
}
