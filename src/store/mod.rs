//! Persistence port for jobs and their dependency edges.
mod memory;
mod snapshot;

use chrono::{DateTime, Utc};

pub use self::memory::MemoryStore;
pub use self::snapshot::Snapshot;
use crate::error::StoreError;
use crate::types::dependency::JobDependency;
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;

/// A repository of jobs. Each call is atomic with respect to every other call
/// on the same store.
pub trait JobStore: Send + Sync {
    /// Persists a new `Waiting` job and returns it with its assigned id.
    fn create(
        &self,
        date_created: DateTime<Utc>,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> Result<Job, StoreError>;

    fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// All jobs, or those with the given status, in id order.
    fn find(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;

    /// Writes `job` back if nobody else has saved it since it was read,
    /// returning the stored copy with its revision bumped.
    fn save(&self, job: &Job) -> Result<Job, StoreError>;

    /// Deletes the job along with every dependency edge touching it.
    fn destroy(&self, id: JobId) -> Result<(), StoreError>;

    /// Records the edge, returning false if it already existed.
    fn add_dependency(&self, edge: JobDependency) -> Result<bool, StoreError>;

    fn remove_dependency(&self, edge: JobDependency)
        -> Result<bool, StoreError>;

    fn prerequisites(&self, id: JobId) -> Result<Vec<JobId>, StoreError>;

    fn dependants(&self, id: JobId) -> Result<Vec<JobId>, StoreError>;
}
