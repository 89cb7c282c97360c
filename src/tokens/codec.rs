use std::sync::Arc;

use super::{Symbol, Token, TokenRole, Vocabulary};
use crate::error::{Error, Result};
use crate::events::{CanonicalEvent, EventKind};

/// Longest event frame: grid, offset, channel, note-on, velocity.
pub const MAX_FRAME_TOKENS: usize = 5;

/// Encodes note events as token frames with a two-token time prefix.
#[derive(Debug, Clone)]
pub struct TimeCodec {
    vocab: Arc<Vocabulary>,
}

impl TimeCodec {
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Self { vocab }
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }

    /// Nearest grid step and signed residual. Deltas past the largest
    /// representable value saturate.
    pub fn split_delta(&self, delta: u32) -> (u32, i16) {
        let step = self.vocab.ticks_per_grid();
        let half = step / 2;
        let delta = delta.min(self.vocab.max_delta());
        let steps = ((delta + half) / step).min(self.vocab.max_grid_steps());
        let offset = delta as i64 - (steps * step) as i64;
        (steps, offset as i16)
    }

    pub fn encode_delta(&self, delta: u32) -> [Token; 2] {
        let (steps, offset) = self.split_delta(delta);
        let (offset_min, _) = self.vocab.offset_bounds();
        let grid = self.vocab.grid_ids().start + steps;
        let offset = self.vocab.offset_ids().start + (offset - offset_min) as u32;
        [
            Token {
                id: grid,
                role: TokenRole::Grid,
            },
            Token {
                id: offset,
                role: TokenRole::Offset,
            },
        ]
    }

    pub fn decode_delta(&self, grid: Token, offset: Token) -> Result<u32> {
        if !self.vocab.grid_ids().contains(&grid.id) {
            return Err(Error::MalformedEncoding {
                expected: TokenRole::Grid,
                found: grid.id,
            });
        }
        if !self.vocab.offset_ids().contains(&offset.id) {
            return Err(Error::MalformedEncoding {
                expected: TokenRole::Offset,
                found: offset.id,
            });
        }

        let steps = (grid.id - self.vocab.grid_ids().start) as i64;
        let (offset_min, _) = self.vocab.offset_bounds();
        let residual = offset_min as i64 + (offset.id - self.vocab.offset_ids().start) as i64;
        let delta = steps * self.vocab.ticks_per_grid() as i64 + residual;
        if delta < 0 {
            return Err(Error::MalformedEncoding {
                expected: TokenRole::Offset,
                found: offset.id,
            });
        }
        Ok(delta as u32)
    }

    pub fn encode(&self, event: &CanonicalEvent) -> Result<Vec<Token>> {
        let mut frame = Vec::with_capacity(MAX_FRAME_TOKENS);
        frame.extend(self.encode_delta(event.delta));
        frame.push(self.lookup(&Symbol::Channel(event.channel))?);

        match event.kind {
            EventKind::NoteOn if event.velocity > 0 => {
                frame.push(self.lookup(&Symbol::NoteOn(event.pitch))?);
                frame.push(self.lookup(&Symbol::Velocity(event.velocity))?);
            }
            EventKind::NoteOn | EventKind::NoteOff => {
                frame.push(self.lookup(&Symbol::NoteOff(event.pitch))?);
            }
            EventKind::Other => {
                return Err(Error::Unencodable(format!("{event:?}")));
            }
        }
        Ok(frame)
    }

    pub fn decoder(&self) -> EventDecoder {
        EventDecoder {
            codec: self.clone(),
            stage: Stage::Grid,
        }
    }

    fn lookup(&self, symbol: &Symbol) -> Result<Token> {
        self.vocab
            .token(symbol)
            .ok_or_else(|| Error::Unencodable(format!("no token for {symbol}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Grid,
    Offset { grid: Token },
    Channel { delta: u32 },
    Note { delta: u32, channel: u8 },
    Velocity { delta: u32, channel: u8, pitch: u8 },
}

/// Reassembles events from a token stream one token at a time.
///
/// Structural tokens pass through without affecting the frame. Any token out
/// of place drops the partial frame and the decoder waits for a grid token.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    codec: TimeCodec,
    stage: Stage,
}

impl EventDecoder {
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Grid
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Grid;
    }

    pub fn feed(&mut self, token: Token) -> Result<Option<CanonicalEvent>> {
        if token.role == TokenRole::Structural {
            return Ok(None);
        }
        let result = self.advance(token);
        if result.is_err() {
            self.stage = Stage::Grid;
        }
        result
    }

    fn advance(&mut self, token: Token) -> Result<Option<CanonicalEvent>> {
        let symbol = self.codec.vocab.symbol(token.id).cloned();
        let malformed = |expected| Error::MalformedEncoding {
            expected,
            found: token.id,
        };

        match (self.stage, symbol) {
            (Stage::Grid, Some(Symbol::Grid(_))) => {
                self.stage = Stage::Offset { grid: token };
                Ok(None)
            }
            (Stage::Grid, _) => Err(malformed(TokenRole::Grid)),
            (Stage::Offset { grid }, Some(Symbol::Offset(_))) => {
                let delta = self.codec.decode_delta(grid, token)?;
                self.stage = Stage::Channel { delta };
                Ok(None)
            }
            (Stage::Offset { .. }, _) => Err(malformed(TokenRole::Offset)),
            (Stage::Channel { delta }, Some(Symbol::Channel(channel))) => {
                self.stage = Stage::Note { delta, channel };
                Ok(None)
            }
            (Stage::Note { delta, channel }, Some(Symbol::NoteOn(pitch))) => {
                self.stage = Stage::Velocity {
                    delta,
                    channel,
                    pitch,
                };
                Ok(None)
            }
            (Stage::Note { delta, channel }, Some(Symbol::NoteOff(pitch))) => {
                self.stage = Stage::Grid;
                Ok(Some(CanonicalEvent::note_off(channel, pitch, delta)))
            }
            (
                Stage::Velocity {
                    delta,
                    channel,
                    pitch,
                },
                Some(Symbol::Velocity(velocity)),
            ) => {
                self.stage = Stage::Grid;
                Ok(Some(CanonicalEvent::note_on(channel, pitch, velocity, delta)))
            }
            (Stage::Channel { .. } | Stage::Note { .. } | Stage::Velocity { .. }, _) => {
                Err(malformed(TokenRole::Event))
            }
        }
    }
}
