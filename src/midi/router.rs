use std::time::Instant;

use midir::MidiOutputConnection;
use ringbuf::traits::{Consumer, Split};
use ringbuf::{HeapCons, HeapRb};

use crate::error::{Error, Result};
use crate::events::{CanonicalEvent, EventKind, GeneratedEvent, MidiMessage, RawEvent, ScheduledEvent};
use crate::timing::{EmissionScheduler, EventProducer, TickClock};

/// The only channel generated material is sent on. Inbound traffic on it
/// is refused so the model never hears its own output as live input.
pub const OUTPUT_CHANNEL: u8 = 0;

pub trait MidiSink {
    fn send(&mut self, message: &[u8]) -> Result<()>;
}

impl MidiSink for MidiOutputConnection {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        MidiOutputConnection::send(self, message).map_err(|e| Error::Device(e.to_string()))
    }
}

impl MidiSink for Vec<Vec<u8>> {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.push(message.to_vec());
        Ok(())
    }
}

/// Maps one inbound message to a raw event. Transport and clock messages
/// carry no note content and yield `None`.
pub fn route_input(message: MidiMessage, delta: u32) -> Result<Option<RawEvent>> {
    let MidiMessage::Voice {
        channel,
        kind,
        data1,
        data2,
    } = message
    else {
        return Ok(None);
    };
    if channel == OUTPUT_CHANNEL {
        return Err(Error::ReservedChannelViolation { channel });
    }
    Ok(Some(RawEvent {
        channel,
        kind,
        pitch: data1,
        velocity: data2,
        delta,
    }))
}

pub struct ChannelRouter {
    scheduler: EmissionScheduler,
    producer: EventProducer,
    consumer: HeapCons<ScheduledEvent>,
    pending_event: Option<ScheduledEvent>,
    sounding: u128,
}

impl ChannelRouter {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::<ScheduledEvent>::new(capacity).split();
        Self {
            scheduler: EmissionScheduler::new(),
            producer,
            consumer,
            pending_event: None,
            sounding: 0,
        }
    }

    pub fn route_generated(
        &mut self,
        events: &[GeneratedEvent],
        clock: &TickClock,
        now: Instant,
    ) -> Result<()> {
        self.scheduler.schedule(events, clock, now, &mut self.producer)
    }

    /// Sends every scheduled event due at or before `now`, in order.
    pub fn emit_due(&mut self, now: Instant, sink: &mut impl MidiSink) -> Result<usize> {
        let mut emitted = 0;
        loop {
            let Some(scheduled) = self.pending_event.take().or_else(|| self.consumer.try_pop()) else {
                break;
            };
            if scheduled.due > now {
                self.pending_event = Some(scheduled);
                break;
            }
            if self.emit(&scheduled.event, sink)? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    pub fn sounding_notes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..128u8).filter(|pitch| self.sounding & (1u128 << pitch) != 0)
    }

    /// Drops everything still queued and releases sounding notes.
    pub fn stop_all_notes(&mut self, sink: &mut impl MidiSink) -> Result<()> {
        self.pending_event = None;
        while self.consumer.try_pop().is_some() {}
        self.scheduler.reset();

        let pitches: Vec<u8> = self.sounding_notes().collect();
        for pitch in pitches {
            self.emit(&CanonicalEvent::note_off(OUTPUT_CHANNEL, pitch, 0), sink)?;
        }
        Ok(())
    }

    fn emit(&mut self, event: &CanonicalEvent, sink: &mut impl MidiSink) -> Result<bool> {
        let Some(bytes) = event.to_midi(OUTPUT_CHANNEL) else {
            return Ok(false);
        };
        let bit = 1u128 << (event.pitch & 0x7F);
        match event.kind {
            EventKind::NoteOn => self.sounding |= bit,
            EventKind::NoteOff => self.sounding &= !bit,
            EventKind::Other => {}
        }
        sink.send(&bytes)?;
        Ok(true)
    }
}
