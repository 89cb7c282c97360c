use std::time::Instant;

/// Ordering matters: `NoteOff < NoteOn` is the canonical kind order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    NoteOff,
    NoteOn,
    /// Control change, pitch bend, aftertouch, program change.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub channel: u8,
    pub kind: EventKind,
    pub pitch: u8,
    pub velocity: u8,
    /// Ticks since the batch anchor.
    pub delta: u32,
}

/// A note event that survived canonicalization. Only `NoteOn` and `NoteOff`
/// are ever constructed through the canonicalizer or the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalEvent {
    pub channel: u8,
    pub kind: EventKind,
    pub pitch: u8,
    pub velocity: u8,
    pub delta: u32,
}

impl CanonicalEvent {
    pub fn note_on(channel: u8, pitch: u8, velocity: u8, delta: u32) -> Self {
        Self {
            channel,
            kind: EventKind::NoteOn,
            pitch,
            velocity,
            delta,
        }
    }

    pub fn note_off(channel: u8, pitch: u8, delta: u32) -> Self {
        Self {
            channel,
            kind: EventKind::NoteOff,
            pitch,
            velocity: 0,
            delta,
        }
    }

    /// Wire bytes for this event on `channel`. `Other` has no outbound form.
    pub fn to_midi(&self, channel: u8) -> Option<[u8; 3]> {
        let channel = channel & 0x0F;
        match self.kind {
            EventKind::NoteOn => Some([0x90 | channel, self.pitch & 0x7F, self.velocity & 0x7F]),
            EventKind::NoteOff => Some([0x80 | channel, self.pitch & 0x7F, 0]),
            EventKind::Other => None,
        }
    }
}

/// Events captured during one I/O tick, ordered canonically.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBatch {
    pub anchor_tick: u64,
    pub events: Vec<CanonicalEvent>,
}

/// A decoded generated event placed on the session timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratedEvent {
    pub tick: u64,
    pub event: CanonicalEvent,
}

#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub due: Instant,
    pub tick: u64,
    pub event: CanonicalEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    Voice {
        channel: u8,
        kind: EventKind,
        data1: u8,
        data2: u8,
    },
    Clock,
    Start,
    Continue,
    Stop,
}

impl MidiMessage {
    /// Parses one wire message. SysEx, active sensing and other system
    /// messages yield `None`.
    pub fn parse(message: &[u8]) -> Option<Self> {
        let status = *message.first()?;
        match status {
            0xF8 => return Some(MidiMessage::Clock),
            0xFA => return Some(MidiMessage::Start),
            0xFB => return Some(MidiMessage::Continue),
            0xFC => return Some(MidiMessage::Stop),
            0xF0..=0xFF => return None,
            _ => {}
        }

        let channel = status & 0x0F;
        let data1 = message.get(1).copied().unwrap_or(0) & 0x7F;
        let data2 = message.get(2).copied().unwrap_or(0) & 0x7F;
        let kind = match status & 0xF0 {
            0x90 if message.len() == 3 && data2 == 0 => EventKind::NoteOff,
            0x90 if message.len() == 3 => EventKind::NoteOn,
            0x80 if message.len() == 3 => EventKind::NoteOff,
            0x80 | 0x90 => return None,
            _ => EventKind::Other,
        };

        Some(MidiMessage::Voice {
            channel,
            kind,
            data1,
            data2,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceMessage {
    pub at: Instant,
    pub message: MidiMessage,
}
