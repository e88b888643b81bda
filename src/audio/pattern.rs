//! FSK symbol alphabet and random pattern generation
//!
//! A pattern is the shared secret of one verification round: a fixed-length
//! sequence of binary symbols drawn uniformly at random. Unpredictability is
//! the security property, so generation is never seeded deterministically.

use rand::Rng;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One FSK symbol.
///
/// `High` and `Low` map to the two carrier frequencies. `Unknown` marks an
/// undecodable slot in detector output and is never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Upper carrier frequency
    High,
    /// Lower carrier frequency
    Low,
    /// Undecodable slot (detector output only)
    Unknown,
}

impl Symbol {
    /// Character representation used in the persisted record schema
    pub fn as_char(self) -> char {
        match self {
            Symbol::High => 'H',
            Symbol::Low => 'L',
            Symbol::Unknown => '?',
        }
    }

    /// Parse the schema character back into a symbol
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'H' => Some(Symbol::High),
            'L' => Some(Symbol::Low),
            '?' => Some(Symbol::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_char(self.as_char())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let c = char::deserialize(deserializer)?;
        Symbol::from_char(c).ok_or_else(|| de::Error::custom(format!("invalid symbol: {c:?}")))
    }
}

/// A fixed-length random symbol sequence, immutable once generated.
///
/// # Example
/// ```
/// use proxitone::audio::pattern::Pattern;
///
/// let pattern = Pattern::generate(6);
/// assert_eq!(pattern.len(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(Vec<Symbol>);

impl Pattern {
    /// Generate a pattern of `len` symbols, each drawn independently with
    /// probability 0.5 for High/Low.
    pub fn generate(len: usize) -> Self {
        let mut rng = rand::thread_rng();
        let symbols = (0..len)
            .map(|_| {
                if rng.gen_bool(0.5) {
                    Symbol::High
                } else {
                    Symbol::Low
                }
            })
            .collect();
        Pattern(symbols)
    }

    /// Build a pattern from explicit symbols.
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        Pattern(symbols)
    }

    /// Number of symbols in the pattern
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the pattern holds no symbols
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Symbols in emission order
    pub fn symbols(&self) -> &[Symbol] {
        &self.0
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            write!(f, "{s}")?;
        }
        Ok(())
    }
}
