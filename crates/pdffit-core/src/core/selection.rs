use phf::{Map, phf_map};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raw value of the `ALL` alias at the engine boundary.
pub const ALL: i64 = -1;

static SELECTION_ALIASES: Map<&'static str, i64> = phf_map! {
    "ALL" => ALL,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Unknown selection alias '{0}' (expected a positive integer or 'ALL')")]
    UnknownAlias(String),
    #[error("Selection index must be positive or the ALL alias (got {0})")]
    InvalidIndex(i64),
}

/// A phase, dataset, parameter or atom-type selection: either one 1-based
/// index or every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    All,
    Index(usize),
}

impl Selector {
    pub fn from_raw(raw: i64) -> Result<Self, SelectionError> {
        match raw {
            ALL => Ok(Selector::All),
            n if n >= 1 => Ok(Selector::Index(n as usize)),
            n => Err(SelectionError::InvalidIndex(n)),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Selector::All => ALL,
            Selector::Index(n) => n as i64,
        }
    }

    pub fn matches(self, index: usize) -> bool {
        match self {
            Selector::All => true,
            Selector::Index(n) => n == index,
        }
    }
}

impl FromStr for Selector {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(&raw) = SELECTION_ALIASES.get(trimmed.to_ascii_uppercase().as_str()) {
            return Selector::from_raw(raw);
        }
        let raw: i64 = trimmed
            .parse()
            .map_err(|_| SelectionError::UnknownAlias(trimmed.to_string()))?;
        Selector::from_raw(raw)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("ALL"),
            Selector::Index(n) => write!(f, "{}", n),
        }
    }
}

/// Conversion accepted by every operation taking a selection: a
/// [`Selector`], a raw integer (`-1` meaning all), or text (`"ALL"` in any
/// case, or a number).
pub trait IntoSelector {
    fn into_selector(self) -> Result<Selector, SelectionError>;
}

impl IntoSelector for Selector {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        Ok(self)
    }
}

impl IntoSelector for usize {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        Selector::from_raw(self as i64)
    }
}

impl IntoSelector for i32 {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        Selector::from_raw(i64::from(self))
    }
}

impl IntoSelector for i64 {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        Selector::from_raw(self)
    }
}

impl IntoSelector for &str {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        self.parse()
    }
}

impl IntoSelector for String {
    fn into_selector(self) -> Result<Selector, SelectionError> {
        self.parse()
    }
}
