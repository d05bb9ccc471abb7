use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker task state vocabulary plus the scheduler-introduced `NEW`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskState {
    /// Terminal states from which no further transition occurs.
    pub const READY_STATES: [Self; 3] = [Self::Success, Self::Failure, Self::Revoked];

    #[must_use]
    pub fn is_ready(self) -> bool {
        Self::READY_STATES.contains(&self)
    }

    /// Whether writing `self` over `current` preserves monotonicity: ready
    /// states are frozen, everything else may still move forward.
    #[must_use]
    pub fn supersedes(self, current: Self) -> bool {
        self != current && !current.is_ready()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown task state: {0}")]
pub struct UnknownTaskState(pub String);

impl FromStr for TaskState {
    type Err = UnknownTaskState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(Self::New),
            "PENDING" => Ok(Self::Pending),
            "STARTED" => Ok(Self::Started),
            "RETRY" => Ok(Self::Retry),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "REVOKED" => Ok(Self::Revoked),
            other => Err(UnknownTaskState(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState;

    #[test]
    fn ready_states_are_frozen() {
        for ready in TaskState::READY_STATES {
            assert!(ready.is_ready());
            assert!(!TaskState::Started.supersedes(ready));
            assert!(!TaskState::Success.supersedes(ready));
        }
    }

    #[test]
    fn non_ready_states_move_forward() {
        assert!(TaskState::Started.supersedes(TaskState::New));
        assert!(TaskState::Success.supersedes(TaskState::Started));
        assert!(!TaskState::Started.supersedes(TaskState::Started));
    }

    #[test]
    fn round_trips_through_strings() {
        for state in [
            TaskState::New,
            TaskState::Pending,
            TaskState::Started,
            TaskState::Retry,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Revoked,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("DONE".parse::<TaskState>().is_err());
    }
}
