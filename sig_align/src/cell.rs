use serde::{Deserialize, Serialize};

/// One sample slot of a channel as delivered by the tokenizer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Cell {
    Value(f64),
    Missing,
}

impl Cell {
    /// Classify a raw token. Blank tokens and any of `missing_tokens` are
    /// `Missing`; finite numbers are `Value`. Returns `None` for anything else.
    pub fn parse(token: &str, missing_tokens: &[String]) -> Option<Cell> {
        let trimmed = token.trim();
        if trimmed.is_empty() || missing_tokens.iter().any(|m| m.trim() == trimmed) {
            return Some(Cell::Missing);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Some(Cell::Value(v)),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Cell::Value(v) => Some(*v),
            Cell::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Value(value)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Cell::Missing, Cell::Value)
    }
}
