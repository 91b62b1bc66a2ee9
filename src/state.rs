use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::{Result, ShardErr};

/// The lifecycle state of a unit.
///
/// A step walks every unit through `Idle -> Forward -> Idle -> BackwardPre -> BackwardPost`
/// and the root's finalization sends them all back to `Idle`. `SummonFullParams` is only
/// entered from `Idle` and blocks forward and backward until the summoning scope ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingState {
    #[default]
    Idle,
    Forward,
    BackwardPre,
    BackwardPost,
    SummonFullParams,
}

impl Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainingState::Idle => "IDLE",
            TrainingState::Forward => "FORWARD",
            TrainingState::BackwardPre => "BACKWARD_PRE",
            TrainingState::BackwardPost => "BACKWARD_POST",
            TrainingState::SummonFullParams => "SUMMON_FULL_PARAMS",
        };

        write!(f, "{s}")
    }
}

/// Checks that `actual` is one of the `expected` states.
///
/// # Arguments
/// * `unit` - The path of the unit being checked, used in the error.
/// * `actual` - The unit's current state.
/// * `expected` - The states the caller is allowed to run in.
///
/// # Returns
/// An `InvalidState` error naming both the expected and the actual states on mismatch.
pub fn assert_state(unit: &str, actual: TrainingState, expected: &[TrainingState]) -> Result<()> {
    if expected.contains(&actual) {
        return Ok(());
    }

    Err(ShardErr::InvalidState {
        unit: unit.to_string(),
        expected: expected.to_vec(),
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_names_both_states() {
        let err = assert_state(
            "encoder",
            TrainingState::BackwardPre,
            &[TrainingState::Idle, TrainingState::Forward],
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "unit `encoder`: expected to be in states [IDLE, FORWARD] but current state is BACKWARD_PRE"
        );
    }

    #[test]
    fn accepts_any_listed_state() {
        let expected = [TrainingState::BackwardPre, TrainingState::BackwardPost];
        assert!(assert_state("", TrainingState::BackwardPost, &expected).is_ok());
    }
}
