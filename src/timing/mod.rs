mod canonical;
mod clock;
mod scheduler;

pub use canonical::{canonical_order, canonicalize};
pub use clock::{MIDI_CLOCK_PPQN, TickClock};
pub use scheduler::{EmissionScheduler, EventProducer};
