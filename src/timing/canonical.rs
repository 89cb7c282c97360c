use std::cmp::Ordering;

use crate::events::{CanonicalEvent, EventKind, RawEvent};

/// Orders a burst of simultaneous device events.
///
/// Controller, pitch-bend and other non-note messages are dropped
/// unconditionally. The remaining events are sorted by delta, then kind
/// (note-off first), channel, pitch and finally velocity, which makes the
/// result independent of arrival order.
pub fn canonicalize(batch: &[RawEvent]) -> Vec<CanonicalEvent> {
    let mut events: Vec<CanonicalEvent> = batch
        .iter()
        .filter(|e| e.kind != EventKind::Other)
        .map(|e| CanonicalEvent {
            channel: e.channel,
            kind: e.kind,
            pitch: e.pitch,
            velocity: if e.kind == EventKind::NoteOff { 0 } else { e.velocity },
            delta: e.delta,
        })
        .collect();

    events.sort_by(canonical_order);
    events
}

pub fn canonical_order(a: &CanonicalEvent, b: &CanonicalEvent) -> Ordering {
    a.delta
        .cmp(&b.delta)
        .then(a.kind.cmp(&b.kind))
        .then(a.channel.cmp(&b.channel))
        .then(a.pitch.cmp(&b.pitch))
        .then(a.velocity.cmp(&b.velocity))
}
