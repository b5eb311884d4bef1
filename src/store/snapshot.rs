use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SnapshotError;
use crate::types::dependency::JobDependency;
use crate::types::job::{Job, JobId};

/// A point-in-time image of a whole store, as written to the state file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Snapshot {
    /// Next id to hand out. Ids of destroyed jobs are never reused.
    #[serde(rename = "next-id")]
    pub next_id: JobId,
    pub jobs: Vec<Job>,
    pub dependencies: Vec<JobDependency>,
}

impl Snapshot {
    /// Reads a snapshot, returning `None` if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            },
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_yaml::from_str(&text)?;
        debug!(
            path = %path.display(),
            jobs = snapshot.jobs.len(),
            "loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Writes the snapshot next to `path` and renames it into place, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let text = serde_yaml::to_string(self)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(
            path = %path.display(),
            jobs = self.jobs.len(),
            "saved snapshot"
        );
        Ok(())
    }
}
