use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a run currently is.
///
/// `RollingBack` is entered from the download, verify and replace phases and
/// always ends in `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    FetchingManifest,
    StoppingProcesses,
    Downloading,
    Verifying,
    Replacing,
    StartingProcesses,
    CleaningUp,
    RollingBack,
    Done,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Cancelled | RunState::Failed)
    }

    /// Stable snake_case name, as used on the event bus
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::FetchingManifest => "fetching_manifest",
            RunState::StoppingProcesses => "stopping_processes",
            RunState::Downloading => "downloading",
            RunState::Verifying => "verifying",
            RunState::Replacing => "replacing",
            RunState::StartingProcesses => "starting_processes",
            RunState::CleaningUp => "cleaning_up",
            RunState::RollingBack => "rolling_back",
            RunState::Done => "done",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::RollingBack.is_terminal());
        assert!(!RunState::Idle.is_terminal());
    }

    #[test]
    fn test_serde_name_matches_display() {
        let json = serde_json::to_string(&RunState::StartingProcesses).unwrap();
        assert_eq!(json, format!("\"{}\"", RunState::StartingProcesses));
    }
}
