//! Per-operating-point progression.
//!
//! ```text
//! Pending ──▶ EncodingEvaluating ──▶ Aggregated ──▶ Persisted
//! ```
//!
//! Transitions only move forward by one step. Points restored from a
//! persisted result file start in `Persisted`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, EvalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingPointState {
    Pending,
    EncodingEvaluating,
    Aggregated,
    Persisted,
}

impl OperatingPointState {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::EncodingEvaluating),
            Self::EncodingEvaluating => Some(Self::Aggregated),
            Self::Aggregated => Some(Self::Persisted),
            Self::Persisted => None,
        }
    }

    /// Move to `to`, which must be the immediate successor.
    pub fn advance(&mut self, to: Self) -> EvalResult<()> {
        if self.next() != Some(to) {
            return Err(EvalError::config(
                "sweep.state",
                format!("{} -> {}", self, to),
                "illegal operating point transition",
            ));
        }
        *self = to;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Persisted
    }
}

impl fmt::Display for OperatingPointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::EncodingEvaluating => "ENCODING_EVALUATING",
            Self::Aggregated => "AGGREGATED",
            Self::Persisted => "PERSISTED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_forward_to_persisted() {
        let mut state = OperatingPointState::Pending;
        for to in [
            OperatingPointState::EncodingEvaluating,
            OperatingPointState::Aggregated,
            OperatingPointState::Persisted,
        ] {
            state.advance(to).unwrap();
        }
        assert!(state.is_terminal());
        assert_eq!(state.next(), None);
    }

    #[test]
    fn rejects_skips_and_rewinds() {
        let mut state = OperatingPointState::Pending;
        assert!(state.advance(OperatingPointState::Aggregated).is_err());
        assert_eq!(state, OperatingPointState::Pending);

        let mut done = OperatingPointState::Persisted;
        assert!(done.advance(OperatingPointState::Pending).is_err());
    }
}
