use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// Jobs are created `Waiting`, and only ever move along the edges returned by
/// [`JobStatus::valid_transitions`]. `Completed` and `Failed` are terminal.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// The statuses a job in this status may move to next.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;

        match self {
            Waiting => &[Running],
            Running => &[Completed, Failed, Waiting],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        use JobStatus::*;

        match self {
            Waiting => "waiting",
            Running => "running",
            Completed => "completed",
            Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
