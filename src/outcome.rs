use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal status recorded once per scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Timeout,
    Stuck,
    Fallen,
    ServerStartFailed,
    FileNotFound,
    MissingDestination,
    ScriptError,
    ProcessingError,
}

impl OutcomeStatus {
    pub const ALL: [OutcomeStatus; 9] = [
        OutcomeStatus::Success,
        OutcomeStatus::Timeout,
        OutcomeStatus::Stuck,
        OutcomeStatus::Fallen,
        OutcomeStatus::ServerStartFailed,
        OutcomeStatus::FileNotFound,
        OutcomeStatus::MissingDestination,
        OutcomeStatus::ScriptError,
        OutcomeStatus::ProcessingError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Stuck => "stuck",
            OutcomeStatus::Fallen => "fallen",
            OutcomeStatus::ServerStartFailed => "server_start_failed",
            OutcomeStatus::FileNotFound => "file_not_found",
            OutcomeStatus::MissingDestination => "missing_destination",
            OutcomeStatus::ScriptError => "script_error",
            OutcomeStatus::ProcessingError => "processing_error",
        }
    }

    /// Input defects never reach the simulator.
    pub fn is_input_defect(self) -> bool {
        matches!(
            self,
            OutcomeStatus::FileNotFound | OutcomeStatus::MissingDestination
        )
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        OutcomeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown outcome status {value:?}"))
    }
}
