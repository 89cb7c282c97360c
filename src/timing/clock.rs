use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// MIDI clock resolution, pulses per quarter note.
pub const MIDI_CLOCK_PPQN: u32 = 24;

const MIN_BPM: f64 = 20.0;
const MAX_BPM: f64 = 400.0;

/// Maps wall-clock instants onto a monotonic musical tick timeline.
///
/// Tempo comes from configuration until an external MIDI clock starts
/// sending pulses, after which it follows the averaged pulse interval.
#[derive(Debug, Clone)]
pub struct TickClock {
    ticks_per_quarter: u32,
    tick_nanos: f64,
    anchor_at: Instant,
    anchor_tick: u64,
    last_pulse: Option<Instant>,
    pulse_intervals: VecDeque<Duration>,
}

impl TickClock {
    pub fn new(bpm: f64, ticks_per_quarter: u32, origin: Instant) -> Self {
        let ticks_per_quarter = ticks_per_quarter.max(1);
        Self {
            ticks_per_quarter,
            tick_nanos: tick_nanos(bpm, ticks_per_quarter),
            anchor_at: origin,
            anchor_tick: 0,
            last_pulse: None,
            pulse_intervals: VecDeque::with_capacity(MIDI_CLOCK_PPQN as usize),
        }
    }

    pub fn ticks_per_quarter(&self) -> u32 {
        self.ticks_per_quarter
    }

    pub fn bpm(&self) -> f64 {
        60.0e9 / (self.tick_nanos * self.ticks_per_quarter as f64)
    }

    /// Instants before the current anchor map to the anchor tick.
    pub fn tick_at(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.anchor_at);
        self.anchor_tick + (elapsed.as_nanos() as f64 / self.tick_nanos) as u64
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        Duration::from_nanos((ticks as f64 * self.tick_nanos) as u64)
    }

    pub fn set_bpm(&mut self, bpm: f64, at: Instant) {
        self.anchor_tick = self.tick_at(at);
        self.anchor_at = at;
        self.tick_nanos = tick_nanos(bpm, self.ticks_per_quarter);
    }

    pub fn on_clock_pulse(&mut self, at: Instant) {
        if let Some(previous) = self.last_pulse.replace(at) {
            if self.pulse_intervals.len() == MIDI_CLOCK_PPQN as usize {
                self.pulse_intervals.pop_front();
            }
            self.pulse_intervals
                .push_back(at.saturating_duration_since(previous));
        }

        if self.pulse_intervals.len() >= 2 {
            let total: Duration = self.pulse_intervals.iter().sum();
            let mean = total.as_secs_f64() / self.pulse_intervals.len() as f64;
            if mean > 0.0 {
                let bpm = 60.0 / (mean * MIDI_CLOCK_PPQN as f64);
                self.set_bpm(bpm, at);
            }
        }
    }

    /// A transport Start snaps the timeline forward to the next quarter
    /// boundary so ticks stay monotonic, and restarts tempo estimation.
    pub fn on_start(&mut self, at: Instant) {
        let now = self.tick_at(at);
        let tpq = self.ticks_per_quarter as u64;
        self.anchor_tick = now.div_ceil(tpq) * tpq;
        self.anchor_at = at;
        self.last_pulse = None;
        self.pulse_intervals.clear();
        tracing::info!(tick = self.anchor_tick, "transport start");
    }

    pub fn on_stop(&mut self) {
        self.last_pulse = None;
        self.pulse_intervals.clear();
        tracing::info!(bpm = self.bpm(), "transport stop, holding tempo");
    }
}

fn tick_nanos(bpm: f64, ticks_per_quarter: u32) -> f64 {
    let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
    60.0e9 / (bpm * ticks_per_quarter as f64)
}
