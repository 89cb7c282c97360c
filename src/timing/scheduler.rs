use std::time::Instant;

use ringbuf::traits::Producer;

use super::TickClock;
use crate::error::{Error, Result};
use crate::events::{GeneratedEvent, ScheduledEvent};

pub type EventProducer = ringbuf::HeapProd<ScheduledEvent>;

/// Turns timeline ticks of generated events into wall-clock due times.
///
/// Each event is placed relative to the event scheduled before it, so the
/// generated rhythm survives even when compute falls behind and the whole
/// phrase has to slide later.
#[derive(Debug, Default)]
pub struct EmissionScheduler {
    last: Option<(u64, Instant)>,
}

impl EmissionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn due_instant(&self, tick: u64, clock: &TickClock, now: Instant) -> Instant {
        let due = match self.last {
            Some((last_tick, last_at)) => {
                last_at + clock.ticks_to_duration(tick.saturating_sub(last_tick))
            }
            None => now + clock.ticks_to_duration(tick.saturating_sub(clock.tick_at(now))),
        };
        due.max(now)
    }

    pub fn schedule(
        &mut self,
        events: &[GeneratedEvent],
        clock: &TickClock,
        now: Instant,
        producer: &mut EventProducer,
    ) -> Result<()> {
        for generated in events {
            let due = self.due_instant(generated.tick, clock, now);
            let scheduled = ScheduledEvent {
                due,
                tick: generated.tick,
                event: generated.event,
            };
            if producer.try_push(scheduled).is_err() {
                return Err(Error::ScheduleFull);
            }
            self.last = Some((generated.tick, due));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CanonicalEvent;
    use ringbuf::HeapRb;
    use ringbuf::traits::{Consumer, Split};
    use std::time::Duration;

    fn generated(tick: u64) -> GeneratedEvent {
        GeneratedEvent {
            tick,
            event: CanonicalEvent::note_on(0, 60, 100, 0),
        }
    }

    #[test]
    fn spaces_events_by_tick_gap() {
        let origin = Instant::now();
        let clock = TickClock::new(120.0, 100, origin);
        let (mut producer, mut consumer) = HeapRb::<ScheduledEvent>::new(8).split();
        let mut scheduler = EmissionScheduler::new();

        scheduler
            .schedule(&[generated(100), generated(150)], &clock, origin, &mut producer)
            .unwrap();

        let first = consumer.try_pop().unwrap();
        let second = consumer.try_pop().unwrap();
        assert_eq!(first.due, origin + Duration::from_millis(500));
        assert_eq!(second.due - first.due, Duration::from_millis(250));
    }

    #[test]
    fn late_events_slide_but_keep_spacing() {
        let origin = Instant::now();
        let clock = TickClock::new(120.0, 100, origin);
        let (mut producer, mut consumer) = HeapRb::<ScheduledEvent>::new(8).split();
        let mut scheduler = EmissionScheduler::new();
        let now = origin + Duration::from_secs(2);

        scheduler
            .schedule(&[generated(10), generated(60)], &clock, now, &mut producer)
            .unwrap();

        let first = consumer.try_pop().unwrap();
        let second = consumer.try_pop().unwrap();
        assert_eq!(first.due, now);
        assert_eq!(second.due, now + Duration::from_millis(250));
    }

    #[test]
    fn full_buffer_reports_error() {
        let origin = Instant::now();
        let clock = TickClock::new(120.0, 100, origin);
        let (mut producer, _consumer) = HeapRb::<ScheduledEvent>::new(1).split();
        let mut scheduler = EmissionScheduler::new();

        let result = scheduler.schedule(&[generated(1), generated(2)], &clock, origin, &mut producer);
        assert!(matches!(result, Err(Error::ScheduleFull)));
    }
}
