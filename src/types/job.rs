use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::states::JobStatus;
use crate::error::{InvalidTransition, LeaseHeld, NotRunning};

pub type JobId = u64;

/// A persisted unit of asynchronous work.
///
/// `Job` only knows how to move itself between statuses; persisting the result
/// is the job store's business.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// The job must not start before this time, if set.
    pub scheduled_start: Option<DateTime<Utc>>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_ended: Option<DateTime<Utc>>,
    pub lease_expires: Option<DateTime<Utc>>,
    pub log: Option<String>,
    /// Number of times the job has entered `Running`.
    pub attempt_count: u32,
    /// Bumped by the store on every successful save.
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        date_created: DateTime<Utc>,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Waiting,
            scheduled_start,
            date_created,
            date_started: None,
            date_ended: None,
            lease_expires: None,
            log: None,
            attempt_count: 0,
            revision: 0,
        }
    }

    fn set_status(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Marks the job as running, counting a new attempt.
    pub fn start(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.set_status(JobStatus::Running)?;
        self.date_started = Some(now);
        self.date_ended = None;
        self.attempt_count += 1;
        Ok(())
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.set_status(JobStatus::Completed)?;
        self.date_ended = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.set_status(JobStatus::Failed)?;
        self.date_ended = Some(now);
        Ok(())
    }

    /// Returns a running job to the waiting state so it can be retried.
    pub fn queue(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.set_status(JobStatus::Waiting)?;
        self.date_ended = Some(now);
        Ok(())
    }

    pub fn lease_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires.is_some_and(|expires| expires > now)
    }

    /// Takes a lease lasting `duration` from `now`, unless someone else's is
    /// still live.
    pub fn acquire_lease(
        &mut self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), LeaseHeld> {
        if let Some(expires) = self.lease_expires.filter(|e| *e > now) {
            return Err(LeaseHeld { expires });
        }
        self.lease_expires = Some(now + duration);
        Ok(())
    }

    /// Pushes the lease on a running job out to `duration` from `now`, even
    /// if it has already lapsed.
    pub fn renew_lease(
        &mut self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), NotRunning> {
        if self.status != JobStatus::Running {
            return Err(NotRunning {
                status: self.status,
            });
        }
        self.lease_expires = Some(now + duration);
        Ok(())
    }

    pub fn release_lease(&mut self) {
        self.lease_expires = None;
    }

    /// True once any scheduled start time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.map_or(true, |start| start <= now)
    }

    pub fn append_log(&mut self, line: &str) {
        match &mut self.log {
            Some(log) => {
                if !log.is_empty() && !log.ends_with('\n') {
                    log.push('\n');
                }
                log.push_str(line);
            },
            None => self.log = Some(line.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn fresh() -> Job {
        Job::new(1, t(0), None)
    }

    #[test]
    fn test_new_job_is_waiting() {
        let job = fresh();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt_count, 0);
        assert!(job.date_started.is_none());
        assert!(job.date_ended.is_none());
    }

    #[test]
    fn test_start_from_waiting() {
        let mut job = fresh();
        job.date_ended = Some(t(1));

        job.start(t(5)).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.date_started, Some(t(5)));
        assert_eq!(job.date_ended, None);
    }

    #[test]
    fn test_finishing_without_start_changes_nothing() {
        type Op = fn(&mut Job, DateTime<Utc>) -> Result<(), InvalidTransition>;
        let ops: [(Op, JobStatus); 3] = [
            (Job::complete, JobStatus::Completed),
            (Job::fail, JobStatus::Failed),
            (Job::queue, JobStatus::Waiting),
        ];

        for (op, to) in ops {
            let mut job = fresh();
            let before = job.clone();

            assert_eq!(
                op(&mut job, t(1)),
                Err(InvalidTransition {
                    from: JobStatus::Waiting,
                    to
                })
            );
            assert_eq!(job, before);
        }
    }

    #[test]
    fn test_start_then_complete() {
        let mut job = fresh();
        job.start(t(1)).unwrap();
        job.complete(t(2)).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.date_ended, Some(t(2)));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut completed = fresh();
        completed.start(t(1)).unwrap();
        completed.complete(t(2)).unwrap();

        let mut failed = fresh();
        failed.start(t(1)).unwrap();
        failed.fail(t(2)).unwrap();
        assert_eq!(failed.date_ended, Some(t(2)));

        for mut job in [completed, failed] {
            let before = job.clone();
            assert!(job.start(t(3)).is_err());
            assert!(job.complete(t(3)).is_err());
            assert!(job.fail(t(3)).is_err());
            assert!(job.queue(t(3)).is_err());
            assert_eq!(job, before);
        }
    }

    #[test]
    fn test_attempts_count_each_start() {
        let mut job = fresh();
        for n in 1..=5 {
            job.start(t(n)).unwrap();
            job.queue(t(n)).unwrap();
            assert_eq!(job.status, JobStatus::Waiting);
            assert_eq!(job.date_ended, Some(t(n)));
        }
        assert_eq!(job.attempt_count, 5);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut job = fresh();
        job.start(t(1)).unwrap();
        assert_eq!(
            job.start(t(2)),
            Err(InvalidTransition {
                from: JobStatus::Running,
                to: JobStatus::Running
            })
        );
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn test_lease() {
        let mut job = fresh();
        assert!(!job.lease_held(t(0)));

        job.acquire_lease(t(0), Duration::seconds(300)).unwrap();
        assert_eq!(job.lease_expires, Some(t(300)));
        assert!(job.lease_held(t(299)));
        assert!(!job.lease_held(t(300)));

        assert_eq!(
            job.acquire_lease(t(10), Duration::seconds(5)),
            Err(LeaseHeld { expires: t(300) })
        );

        // An expired lease can be taken over.
        job.acquire_lease(t(301), Duration::seconds(5)).unwrap();
        assert_eq!(job.lease_expires, Some(t(306)));

        job.release_lease();
        assert!(job.lease_expires.is_none());
    }

    #[test]
    fn test_renew_lease_only_while_running() {
        let mut job = fresh();
        assert_eq!(
            job.renew_lease(t(0), Duration::seconds(60)),
            Err(NotRunning {
                status: JobStatus::Waiting
            })
        );

        job.acquire_lease(t(0), Duration::seconds(60)).unwrap();
        job.start(t(0)).unwrap();

        // Renewal extends a live lease, and revives a lapsed one.
        job.renew_lease(t(30), Duration::seconds(60)).unwrap();
        assert_eq!(job.lease_expires, Some(t(90)));
        job.renew_lease(t(120), Duration::seconds(60)).unwrap();
        assert_eq!(job.lease_expires, Some(t(180)));

        job.complete(t(130)).unwrap();
        assert!(job.renew_lease(t(130), Duration::seconds(60)).is_err());
    }

    #[test]
    fn test_is_due() {
        assert!(fresh().is_due(t(0)));

        let job = Job::new(2, t(0), Some(t(60)));
        assert!(!job.is_due(t(59)));
        assert!(job.is_due(t(60)));
    }

    #[test]
    fn test_append_log() {
        let mut job = fresh();
        job.append_log("scanning branch");
        job.append_log("found 3 revisions");
        assert_eq!(
            job.log.as_deref(),
            Some("scanning branch\nfound 3 revisions")
        );
    }
}
