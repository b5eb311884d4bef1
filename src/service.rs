//! The unit of work that drives jobs through their lifecycle.
//!
//! [`JobService`] ties a [`JobStore`] to a [`Clock`] and the lease policy.
//! Every operation reads the job, applies a transition in memory, and saves it
//! back; the store's revision check turns that into a compare-and-swap, so
//! concurrent workers racing on one job see exactly one winner.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{InvalidTransition, JobError, JobResult, StoreError};
use crate::store::JobStore;
use crate::types::dependency::JobDependency;
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;

pub const DEFAULT_LEASE_SECONDS: u32 = 300;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Lease length used by `claim`, and by `acquire_lease` and `renew_lease`
    /// when no explicit duration is given.
    pub lease_duration: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECONDS.into()),
        }
    }
}

/// Job counts by status, plus how many waiting jobs are ready to claim.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobCounts {
    #[serde(rename = "current-jobs-waiting")]
    pub waiting: u64,
    #[serde(rename = "current-jobs-ready")]
    pub ready: u64,
    #[serde(rename = "current-jobs-running")]
    pub running: u64,
    #[serde(rename = "current-jobs-completed")]
    pub completed: u64,
    #[serde(rename = "current-jobs-failed")]
    pub failed: u64,
}

type Transition = fn(&mut Job, DateTime<Utc>) -> Result<(), InvalidTransition>;

/// Rejects a worker whose claim has been superseded by a later attempt.
fn check_attempt(job: &Job, attempt: Option<u32>) -> JobResult<()> {
    match attempt {
        Some(claimed) if claimed != job.attempt_count => {
            Err(JobError::StaleAttempt {
                id: job.id,
                claimed,
                actual: job.attempt_count,
            })
        },
        _ => Ok(()),
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[instrument(skip(self))]
    pub fn create(
        &self,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> JobResult<Job> {
        let job = self.store.create(self.now(), scheduled_start)?;
        info!(id = job.id, "created job");
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> JobResult<Job> {
        Ok(self.store.get(id)?)
    }

    /// Saves `job`, reporting a lost race as [`JobError::Conflict`].
    fn save(&self, job: &Job) -> JobResult<Job> {
        self.store.save(job).map_err(|e| match e {
            StoreError::RevisionMismatch { id, .. } => JobError::Conflict(id),
            e => e.into(),
        })
    }

    fn transition(
        &self,
        id: JobId,
        attempt: Option<u32>,
        apply: Transition,
        release_lease: bool,
    ) -> JobResult<Job> {
        let mut job = self.store.get(id)?;
        check_attempt(&job, attempt)?;
        apply(&mut job, self.now())?;
        if release_lease {
            job.release_lease();
        }
        let job = self.save(&job)?;
        debug!(id, status = %job.status, "transitioned job");
        Ok(job)
    }

    /// Moves a waiting job to running without taking a lease.
    #[instrument(skip(self))]
    pub fn start(&self, id: JobId) -> JobResult<Job> {
        self.transition(id, None, Job::start, false)
    }

    /// Completes a running job. With `attempt`, only if that is still the
    /// job's current attempt.
    #[instrument(skip(self))]
    pub fn complete(&self, id: JobId, attempt: Option<u32>) -> JobResult<Job> {
        self.transition(id, attempt, Job::complete, true)
    }

    #[instrument(skip(self))]
    pub fn fail(&self, id: JobId, attempt: Option<u32>) -> JobResult<Job> {
        self.transition(id, attempt, Job::fail, true)
    }

    /// Puts a running job back to waiting so that it can be retried.
    #[instrument(skip(self))]
    pub fn queue(&self, id: JobId, attempt: Option<u32>) -> JobResult<Job> {
        self.transition(id, attempt, Job::queue, true)
    }

    #[instrument(skip(self))]
    pub fn acquire_lease(
        &self,
        id: JobId,
        duration: Option<Duration>,
    ) -> JobResult<Job> {
        let mut job = self.store.get(id)?;
        job.acquire_lease(
            self.now(),
            duration.unwrap_or(self.config.lease_duration),
        )
        .map_err(|source| JobError::LeaseHeld { id, source })?;
        self.save(&job)
    }

    /// Extends the lease on a running job, so a worker can keep it past the
    /// original lease without the reaper requeueing it.
    #[instrument(skip(self))]
    pub fn renew_lease(
        &self,
        id: JobId,
        duration: Option<Duration>,
        attempt: Option<u32>,
    ) -> JobResult<Job> {
        let mut job = self.store.get(id)?;
        check_attempt(&job, attempt)?;
        job.renew_lease(
            self.now(),
            duration.unwrap_or(self.config.lease_duration),
        )
        .map_err(|source| JobError::NotRunning { id, source })?;
        self.save(&job)
    }

    pub fn append_log(&self, id: JobId, text: &str) -> JobResult<Job> {
        let mut job = self.store.get(id)?;
        job.append_log(text);
        self.save(&job)
    }

    /// Makes `prerequisite` something `dependant` must wait for. Returns
    /// false if that was already the case.
    #[instrument(skip(self))]
    pub fn add_prerequisite(
        &self,
        dependant: JobId,
        prerequisite: JobId,
    ) -> JobResult<bool> {
        Ok(self
            .store
            .add_dependency(JobDependency::new(prerequisite, dependant))?)
    }

    #[instrument(skip(self))]
    pub fn remove_prerequisite(
        &self,
        dependant: JobId,
        prerequisite: JobId,
    ) -> JobResult<bool> {
        Ok(self
            .store
            .remove_dependency(JobDependency::new(prerequisite, dependant))?)
    }

    pub fn prerequisites(&self, id: JobId) -> JobResult<Vec<JobId>> {
        Ok(self.store.prerequisites(id)?)
    }

    pub fn dependants(&self, id: JobId) -> JobResult<Vec<JobId>> {
        Ok(self.store.dependants(id)?)
    }

    /// Deletes the job and every dependency edge that references it.
    #[instrument(skip(self))]
    pub fn destroy(&self, id: JobId) -> JobResult<()> {
        self.store.destroy(id)?;
        info!(id, "destroyed job");
        Ok(())
    }

    /// Prerequisites of `id` that haven't completed yet.
    pub fn pending_prerequisites(&self, id: JobId) -> JobResult<Vec<JobId>> {
        let mut pending = Vec::new();
        for prerequisite in self.store.prerequisites(id)? {
            match self.store.get(prerequisite) {
                Ok(job) if job.status == JobStatus::Completed => {},
                Ok(_) => pending.push(prerequisite),
                // Destroyed since we listed the edges.
                Err(StoreError::NotFound(_)) => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(pending)
    }

    fn prerequisites_met(&self, job: &Job) -> JobResult<bool> {
        Ok(self.pending_prerequisites(job.id)?.is_empty())
    }

    fn is_ready(&self, job: &Job, now: DateTime<Utc>) -> JobResult<bool> {
        Ok(job.status == JobStatus::Waiting
            && job.is_due(now)
            && !job.lease_held(now)
            && self.prerequisites_met(job)?)
    }

    /// Waiting jobs that are due, unleased, and whose prerequisites have all
    /// completed, in id order.
    pub fn ready_jobs(&self) -> JobResult<Vec<Job>> {
        let now = self.now();
        let mut ready = Vec::new();
        for job in self.store.find(Some(JobStatus::Waiting))? {
            if self.is_ready(&job, now)? {
                ready.push(job);
            }
        }
        Ok(ready)
    }

    /// Leases and starts a job as read at `job.revision`.
    fn claim_job(&self, mut job: Job, now: DateTime<Utc>) -> JobResult<Job> {
        let id = job.id;
        if job.status == JobStatus::Waiting
            && !(job.is_due(now) && self.prerequisites_met(&job)?)
        {
            return Err(JobError::NotReady(id));
        }

        job.acquire_lease(now, self.config.lease_duration)
            .map_err(|source| JobError::LeaseHeld { id, source })?;
        job.start(now)?;

        let job = self.save(&job)?;
        info!(id, attempt = job.attempt_count, "claimed job");
        Ok(job)
    }

    /// Atomically takes a lease on a waiting job and starts it.
    #[instrument(skip(self))]
    pub fn claim(&self, id: JobId) -> JobResult<Job> {
        let job = self.store.get(id)?;
        self.claim_job(job, self.now())
    }

    /// Claims the first ready job another worker doesn't beat us to.
    #[instrument(skip(self))]
    pub fn claim_next(&self) -> JobResult<Option<Job>> {
        let now = self.now();
        for job in self.ready_jobs()? {
            let id = job.id;
            match self.claim_job(job, now) {
                Ok(job) => return Ok(Some(job)),
                Err(JobError::Conflict(_)) => {
                    debug!(id, "lost race for job, trying the next one");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Returns running jobs whose lease has run out to the waiting state,
    /// returning the ids that were requeued.
    #[instrument(skip(self))]
    pub fn requeue_expired(&self) -> JobResult<Vec<JobId>> {
        let now = self.now();
        let mut requeued = Vec::new();

        for mut job in self.store.find(Some(JobStatus::Running))? {
            if !job.lease_expires.is_some_and(|expires| expires <= now) {
                continue;
            }

            let id = job.id;
            job.queue(now)?;
            job.release_lease();
            match self.save(&job) {
                Ok(_) => {
                    info!(id, "requeued job with expired lease");
                    requeued.push(id);
                },
                Err(JobError::Conflict(_)) => {
                    debug!(id, "job changed while requeueing, skipping");
                },
                Err(e) => return Err(e),
            }
        }

        Ok(requeued)
    }

    pub fn counts(&self) -> JobResult<JobCounts> {
        let now = self.now();
        let mut counts = JobCounts::default();

        for job in self.store.find(None)? {
            match job.status {
                JobStatus::Waiting => {
                    counts.waiting += 1;
                    if self.is_ready(&job, now)? {
                        counts.ready += 1;
                    }
                },
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }

        Ok(counts)
    }
}
