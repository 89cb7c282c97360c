use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenRole {
    Grid,
    Offset,
    Event,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub id: u32,
    pub role: TokenRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Whole grid steps since the previous event.
    Grid(u16),
    /// Signed residual in ticks from the grid point.
    Offset(i16),
    Channel(u8),
    NoteOn(u8),
    NoteOff(u8),
    Velocity(u8),
    /// Header and marker symbols such as `<genre:jazz>` or `<part:bass>`.
    Structural(String),
}

impl Symbol {
    pub fn role(&self) -> TokenRole {
        match self {
            Symbol::Grid(_) => TokenRole::Grid,
            Symbol::Offset(_) => TokenRole::Offset,
            Symbol::Structural(_) => TokenRole::Structural,
            _ => TokenRole::Event,
        }
    }

    pub fn parse(text: &str) -> Option<Symbol> {
        if text.len() > 2 && text.starts_with('<') && text.ends_with('>') {
            return Some(Symbol::Structural(text.to_string()));
        }
        let (kind, value) = text.split_once(':')?;
        let symbol = match kind {
            "grid" => Symbol::Grid(value.parse().ok()?),
            "offset" => Symbol::Offset(value.parse().ok()?),
            "ch" => Symbol::Channel(value.parse().ok().filter(|c| *c < 16)?),
            "on" => Symbol::NoteOn(value.parse().ok().filter(|p| *p < 128)?),
            "off" => Symbol::NoteOff(value.parse().ok().filter(|p| *p < 128)?),
            "vel" => Symbol::Velocity(value.parse().ok().filter(|v| (1..128).contains(v))?),
            _ => return None,
        };
        Some(symbol)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Grid(steps) => write!(f, "grid:{steps}"),
            Symbol::Offset(ticks) => write!(f, "offset:{ticks:+}"),
            Symbol::Channel(channel) => write!(f, "ch:{channel}"),
            Symbol::NoteOn(pitch) => write!(f, "on:{pitch}"),
            Symbol::NoteOff(pitch) => write!(f, "off:{pitch}"),
            Symbol::Velocity(velocity) => write!(f, "vel:{velocity}"),
            Symbol::Structural(name) => f.write_str(name),
        }
    }
}

/// Frozen bidirectional mapping between token ids and symbols.
///
/// Grid and offset symbols must each occupy one contiguous id range. The
/// grid step, in ticks, is the number of offset symbols.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    symbols: Vec<Symbol>,
    ids: HashMap<Symbol, u32>,
    grid_ids: Range<u32>,
    offset_ids: Range<u32>,
    offset_min: i16,
}

impl Vocabulary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut symbols = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let symbol = Symbol::parse(line).ok_or_else(|| Error::InvalidVocabulary {
                line: idx + 1,
                message: format!("unknown symbol '{line}'"),
            })?;
            symbols.push(symbol);
        }
        Self::from_symbols(symbols)
    }

    /// Builds the default layout: structural symbols, the grid block, the
    /// offset block, then channels, note-ons, note-offs and velocities.
    pub fn standard(ticks_per_grid: u16, max_grid_steps: u16, structural: &[&str]) -> Result<Self> {
        let ticks_per_grid = ticks_per_grid.max(1) as i16;
        let offset_min = -(ticks_per_grid / 2);

        let mut symbols: Vec<Symbol> = structural
            .iter()
            .map(|s| Symbol::Structural(s.to_string()))
            .collect();
        symbols.extend((0..=max_grid_steps).map(Symbol::Grid));
        symbols.extend((offset_min..offset_min + ticks_per_grid).map(Symbol::Offset));
        symbols.extend((0..16).map(Symbol::Channel));
        symbols.extend((0..128).map(Symbol::NoteOn));
        symbols.extend((0..128).map(Symbol::NoteOff));
        symbols.extend((1..128).map(Symbol::Velocity));

        Self::from_symbols(symbols)
    }

    pub fn from_symbols(symbols: Vec<Symbol>) -> Result<Self> {
        let mut ids = HashMap::with_capacity(symbols.len());
        for (id, symbol) in symbols.iter().enumerate() {
            if ids.insert(symbol.clone(), id as u32).is_some() {
                return Err(invalid(format!("duplicate symbol '{symbol}' at id {id}")));
            }
        }

        let grid_ids = contiguous_block(&symbols, TokenRole::Grid)?;
        for (i, id) in grid_ids.clone().enumerate() {
            if symbols[id as usize] != Symbol::Grid(i as u16) {
                return Err(invalid(format!("grid symbols must count up from 0 at id {id}")));
            }
        }

        let offset_ids = contiguous_block(&symbols, TokenRole::Offset)?;
        let count = offset_ids.len() as i16;
        let offset_min = -(count / 2);
        for (i, id) in offset_ids.clone().enumerate() {
            if symbols[id as usize] != Symbol::Offset(offset_min + i as i16) {
                return Err(invalid(format!(
                    "offset symbols must run from {offset_min} in steps of 1 (id {id})"
                )));
            }
        }

        let required = (0..16)
            .map(Symbol::Channel)
            .chain((0..128).map(Symbol::NoteOn))
            .chain((0..128).map(Symbol::NoteOff))
            .chain((1..128).map(Symbol::Velocity));
        for symbol in required {
            if !ids.contains_key(&symbol) {
                return Err(invalid(format!("missing symbol '{symbol}'")));
            }
        }

        Ok(Self {
            symbols,
            ids,
            grid_ids,
            offset_ids,
            offset_min,
        })
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for symbol in &self.symbols {
            text.push_str(&symbol.to_string());
            text.push('\n');
        }
        text
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Fails fatally when the model head disagrees with the vocabulary size.
    pub fn check_model(&self, model_vocab: usize) -> Result<()> {
        if model_vocab != self.len() {
            return Err(Error::VocabularyMismatch {
                vocabulary: self.len(),
                model: model_vocab,
            });
        }
        Ok(())
    }

    pub fn token(&self, symbol: &Symbol) -> Option<Token> {
        self.ids.get(symbol).map(|&id| Token {
            id,
            role: symbol.role(),
        })
    }

    pub fn token_by_id(&self, id: u32) -> Option<Token> {
        self.symbols.get(id as usize).map(|s| Token { id, role: s.role() })
    }

    pub fn symbol(&self, id: u32) -> Option<&Symbol> {
        self.symbols.get(id as usize)
    }

    pub fn grid_ids(&self) -> Range<u32> {
        self.grid_ids.clone()
    }

    pub fn offset_ids(&self) -> Range<u32> {
        self.offset_ids.clone()
    }

    pub fn ticks_per_grid(&self) -> u32 {
        self.offset_ids.len() as u32
    }

    pub fn max_grid_steps(&self) -> u32 {
        self.grid_ids.len() as u32 - 1
    }

    pub fn offset_bounds(&self) -> (i16, i16) {
        (
            self.offset_min,
            self.offset_min + self.offset_ids.len() as i16 - 1,
        )
    }

    /// Largest delta with an exact encoding.
    pub fn max_delta(&self) -> u32 {
        self.max_grid_steps() * self.ticks_per_grid() + self.offset_bounds().1.max(0) as u32
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidVocabulary { line: 0, message }
}

fn contiguous_block(symbols: &[Symbol], role: TokenRole) -> Result<Range<u32>> {
    let ids: Vec<u32> = symbols
        .iter()
        .enumerate()
        .filter(|(_, s)| s.role() == role)
        .map(|(id, _)| id as u32)
        .collect();
    let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
        return Err(invalid(format!("no {role:?} symbols")));
    };
    if (last - first) as usize + 1 != ids.len() {
        return Err(invalid(format!("{role:?} symbols must occupy one contiguous id range")));
    }
    Ok(first..last + 1)
}
