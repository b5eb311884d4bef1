use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::job::JobId;
use crate::types::states::JobStatus;

/// A caller asked for a status change the transition table doesn't allow.
///
/// This signals that the caller and the persisted state have diverged, so it
/// is always handed back rather than recovered from.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("invalid job status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Another worker holds an unexpired lease on the job.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("lease is held until {expires}")]
pub struct LeaseHeld {
    pub expires: DateTime<Utc>,
}

/// Only a running job has a lease that can be renewed.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("job is {status}, not running")]
pub struct NotRunning {
    pub status: JobStatus,
}

/// Errors raised by a [`JobStore`](crate::store::JobStore).
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} cannot be its own prerequisite")]
    SelfDependency(JobId),

    /// The edge would let `dependant` transitively depend on itself.
    #[error(
        "making job {prerequisite} a prerequisite of job {dependant} would \
         create a cycle"
    )]
    Cycle {
        prerequisite: JobId,
        dependant: JobId,
    },

    /// A save was based on a stale read of the job.
    #[error(
        "job {id} was modified concurrently (expected revision {expected}, \
         found {actual})"
    )]
    RevisionMismatch { id: JobId, expected: u64, actual: u64 },
}

/// Errors raised by [`JobService`](crate::service::JobService) operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("job {id}: {source}")]
    LeaseHeld {
        id: JobId,
        #[source]
        source: LeaseHeld,
    },

    #[error("job {id}: {source}")]
    NotRunning {
        id: JobId,
        #[source]
        source: NotRunning,
    },

    /// The caller's claim has been superseded by a later attempt.
    #[error("job {id} is on attempt {actual}, not attempt {claimed}")]
    StaleAttempt { id: JobId, claimed: u32, actual: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job is waiting but is scheduled in the future or has unfinished
    /// prerequisites.
    #[error("job {0} is not ready to run")]
    NotReady(JobId),

    /// Another worker claimed or changed the job between our read and write.
    #[error("job {0} was claimed by another worker")]
    Conflict(JobId),
}

pub type JobResult<T> = Result<T, JobError>;

/// Errors raised while reading or writing a store snapshot file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot format: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("snapshot lists job {0} more than once")]
    DuplicateJob(JobId),

    #[error(
        "snapshot dependency of job {dependant} on job {prerequisite} closes \
         a cycle"
    )]
    Cycle {
        prerequisite: JobId,
        dependant: JobId,
    },
}
