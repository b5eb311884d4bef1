use serde::{Deserialize, Serialize};

use super::job::JobId;

/// A directed edge recording that `dependant` may not start until
/// `prerequisite` has completed. The pair is the edge's identity.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct JobDependency {
    pub prerequisite: JobId,
    pub dependant: JobId,
}

impl JobDependency {
    pub fn new(prerequisite: JobId, dependant: JobId) -> Self {
        Self {
            prerequisite,
            dependant,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.prerequisite == self.dependant
    }
}
