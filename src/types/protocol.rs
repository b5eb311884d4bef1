use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{Job, JobId};
use super::serialisable::WireSerialisable;
use super::states::JobStatus;
use crate::service::JobCounts;

/// A command sent by a runner or operator to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobCommand {
    /// Creates a waiting job that may not start for `delay` seconds.
    ///
    /// On the wire: `create <delay>`
    Create { delay: u32 },
    /// Moves a waiting job to running without taking a lease. Runners should
    /// normally use `claim` instead.
    ///
    /// On the wire: `start <id>`
    Start { id: JobId },
    /// Marks a running job as completed and drops its lease. When `attempt`
    /// is given and the job has since been reclaimed under a later attempt,
    /// replies `CONFLICT` and changes nothing.
    ///
    /// On the wire: `complete <id> [<attempt>]`
    Complete { id: JobId, attempt: Option<u32> },
    /// Marks a running job as failed and drops its lease.
    ///
    /// On the wire: `fail <id> [<attempt>]`
    Fail { id: JobId, attempt: Option<u32> },
    /// Returns a running job to the waiting state for a later retry, dropping
    /// its lease.
    ///
    /// On the wire: `queue <id> [<attempt>]`
    Queue { id: JobId, attempt: Option<u32> },
    /// Leases and starts a specific job in one atomic step. Returns
    /// `CLAIMED`, or `NOT_READY`, `LEASE_HELD`, `CONFLICT`,
    /// `INVALID_TRANSITION` or `NOT_FOUND`.
    ///
    /// On the wire: `claim <id>`
    Claim { id: JobId },
    /// As `claim`, but picks the lowest-numbered ready job. Returns `NO_JOBS`
    /// when nothing is ready.
    ///
    /// On the wire: `claim-next`
    ClaimNext,
    /// Takes a lease on a job for `seconds` seconds, or the server default
    /// when `seconds` is 0.
    ///
    /// On the wire: `lease <id> <seconds>`
    Lease { id: JobId, seconds: u32 },
    /// Extends the lease on a running job to `seconds` from now, or the
    /// server default when `seconds` is 0. Workers send this periodically
    /// while a job takes longer than its lease.
    ///
    /// On the wire: `renew <id> <seconds> [<attempt>]`
    Renew {
        id: JobId,
        seconds: u32,
        attempt: Option<u32>,
    },
    /// Appends a line of progress text to a job's log. The text follows the
    /// command line as `n_bytes` bytes plus CRLF.
    ///
    /// On the wire: `log <id> <n_bytes>`
    Log { id: JobId, n_bytes: u32 },
    /// Records that `dependant` must wait for `prerequisite` to complete.
    ///
    /// On the wire: `add-prerequisite <dependant> <prerequisite>`
    AddPrerequisite {
        dependant: JobId,
        prerequisite: JobId,
    },
    /// On the wire: `remove-prerequisite <dependant> <prerequisite>`
    RemovePrerequisite {
        dependant: JobId,
        prerequisite: JobId,
    },
    /// Lists the jobs `id` directly waits on as a YAML list.
    ///
    /// On the wire: `prerequisites <id>`
    Prerequisites { id: JobId },
    /// Lists the jobs directly waiting on `id` as a YAML list.
    ///
    /// On the wire: `dependants <id>`
    Dependants { id: JobId },
    /// Lists the ids of jobs that could be claimed right now.
    ///
    /// On the wire: `list-ready`
    ListReady,
    /// Moves running jobs with expired leases back to waiting, replying with
    /// `REQUEUED <count>`.
    ///
    /// On the wire: `requeue-expired`
    RequeueExpired,
    /// Deletes a job and all dependency edges touching it.
    ///
    /// On the wire: `destroy <id>`
    Destroy { id: JobId },
    /// Describes a single job as a YAML dictionary.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: JobId },
    /// Describes the server and its job counts as a YAML dictionary.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible responses to a `JobCommand`.
#[derive(Debug)]
pub enum JobResponse {
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The request line was too long, a number was malformed or out of range,
    /// or arguments were missing or extra.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// A `log` body was not followed by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// A `log` body was larger than the server accepts.
    ///
    /// On the wire: `LOG_TOO_BIG`.
    LogTooBig,
    /// The job (or either end of a dependency) doesn't exist.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// The requested status change isn't allowed from the job's current
    /// status. This points at a bug in the caller.
    ///
    /// On the wire: `INVALID_TRANSITION <from> <to>`.
    InvalidTransition { from: JobStatus, to: JobStatus },
    /// On the wire: `LEASE_HELD`.
    LeaseHeld,
    /// `renew` was sent for a job that isn't running.
    ///
    /// On the wire: `NOT_RUNNING`.
    NotRunning,
    /// The job is scheduled in the future or has unfinished prerequisites.
    ///
    /// On the wire: `NOT_READY`.
    NotReady,
    /// Another client changed the job between our read and our write, or the
    /// `attempt` given is no longer the job's current one.
    ///
    /// On the wire: `CONFLICT`.
    Conflict,
    /// On the wire: `SELF_DEPENDENCY`.
    SelfDependency,
    /// The new edge would make a job transitively depend on itself.
    ///
    /// On the wire: `CYCLE`.
    Cycle,
    /// On the wire: `CREATED <id>`.
    Created { id: JobId },
    /// On the wire: `STARTED`.
    Started,
    /// On the wire: `COMPLETED`.
    Completed,
    /// On the wire: `FAILED`.
    Failed,
    /// On the wire: `QUEUED`.
    Queued,
    /// In response to `claim` or `claim-next`, the job now running under a
    /// fresh lease and the attempt number this is.
    ///
    /// On the wire: `CLAIMED <id> <attempt>`.
    Claimed { id: JobId, attempt: u32 },
    /// On the wire: `NO_JOBS`.
    NoJobs,
    /// On the wire: `LEASED`.
    Leased,
    /// On the wire: `RENEWED`.
    Renewed,
    /// On the wire: `LOGGED`.
    Logged,
    /// On the wire: `ADDED`.
    Added,
    /// The dependency already existed, so nothing changed.
    ///
    /// On the wire: `ALREADY_PRESENT`.
    AlreadyPresent,
    /// On the wire: `REMOVED`.
    Removed,
    /// On the wire: `DESTROYED`.
    Destroyed,
    /// On the wire: `REQUEUED <count>`.
    Requeued { count: usize },
    /// In response to `prerequisites`, `dependants` or `list-ready`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML list format.
    OkIds { ids: Vec<JobId> },
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
}

/// Renders an `OK <n_bytes>` response carrying `data` as YAML.
fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(_) => b"INTERNAL_ERROR\r\n".to_vec(),
    }
}

impl WireSerialisable for JobResponse {
    fn serialise_wire(&self) -> Vec<u8> {
        use JobResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            LogTooBig => b"LOG_TOO_BIG\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            InvalidTransition { from, to } => {
                format!("INVALID_TRANSITION {from} {to}\r\n").into()
            },
            LeaseHeld => b"LEASE_HELD\r\n".to_vec(),
            NotRunning => b"NOT_RUNNING\r\n".to_vec(),
            NotReady => b"NOT_READY\r\n".to_vec(),
            Conflict => b"CONFLICT\r\n".to_vec(),
            SelfDependency => b"SELF_DEPENDENCY\r\n".to_vec(),
            Cycle => b"CYCLE\r\n".to_vec(),
            Created { id } => format!("CREATED {id}\r\n").into(),
            Started => b"STARTED\r\n".to_vec(),
            Completed => b"COMPLETED\r\n".to_vec(),
            Failed => b"FAILED\r\n".to_vec(),
            Queued => b"QUEUED\r\n".to_vec(),
            Claimed { id, attempt } => {
                format!("CLAIMED {id} {attempt}\r\n").into()
            },
            NoJobs => b"NO_JOBS\r\n".to_vec(),
            Leased => b"LEASED\r\n".to_vec(),
            Renewed => b"RENEWED\r\n".to_vec(),
            Logged => b"LOGGED\r\n".to_vec(),
            Added => b"ADDED\r\n".to_vec(),
            AlreadyPresent => b"ALREADY_PRESENT\r\n".to_vec(),
            Removed => b"REMOVED\r\n".to_vec(),
            Destroyed => b"DESTROYED\r\n".to_vec(),
            Requeued { count } => format!("REQUEUED {count}\r\n").into(),
            OkIds { ids } => ok_yaml(ids),
            OkStatsJob { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: JobId,
    /// job status
    pub state: JobStatus,
    /// seconds since creation
    pub age: i64,
    /// seconds remaining until the scheduled start, or 0
    pub delay: i64,
    /// seconds remaining on the current lease, or 0
    #[serde(rename = "time-left")]
    pub time_left: i64,
    /// number of times the job has been started
    pub attempts: u32,
    #[serde(rename = "date-created")]
    pub date_created: DateTime<Utc>,
    #[serde(rename = "date-started")]
    pub date_started: Option<DateTime<Utc>>,
    #[serde(rename = "date-ended")]
    pub date_ended: Option<DateTime<Utc>>,
    /// number of prerequisites not yet completed
    #[serde(rename = "pending-prerequisites")]
    pub pending_prerequisites: u64,
    pub log: Option<String>,
}

impl JobStats {
    pub fn new(
        job: Job,
        now: DateTime<Utc>,
        pending_prerequisites: u64,
    ) -> Self {
        let until = |t: Option<DateTime<Utc>>| {
            t.map_or(0, |t| (t - now).num_seconds().max(0))
        };

        Self {
            id: job.id,
            state: job.status,
            age: (now - job.date_created).num_seconds().max(0),
            delay: until(job.scheduled_start),
            time_left: until(job.lease_expires),
            attempts: job.attempt_count,
            date_created: job.date_created,
            date_started: job.date_started,
            date_ended: job.date_ended,
            pending_prerequisites,
            log: job.log,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    #[serde(flatten)]
    pub jobs: JobCounts,
    /// number of currently open connections
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    /// cumulative count of connections
    #[serde(rename = "total-connections")]
    pub total_connections: u64,
    /// default lease length in seconds
    #[serde(rename = "default-lease")]
    pub default_lease: i64,
    /// maximum number of bytes in a log body
    #[serde(rename = "max-log-size")]
    pub max_log_size: u32,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
    /// number of seconds since this server process started running
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn wire(resp: JobResponse) -> String {
        String::from_utf8(resp.serialise_wire()).unwrap()
    }

    #[test]
    fn test_simple_responses() {
        assert_eq!(wire(JobResponse::Created { id: 7 }), "CREATED 7\r\n");
        assert_eq!(
            wire(JobResponse::Claimed { id: 7, attempt: 2 }),
            "CLAIMED 7 2\r\n"
        );
        assert_eq!(
            wire(JobResponse::InvalidTransition {
                from: JobStatus::Waiting,
                to: JobStatus::Completed,
            }),
            "INVALID_TRANSITION waiting completed\r\n"
        );
        assert_eq!(wire(JobResponse::NotFound), "NOT_FOUND\r\n");
        assert_eq!(wire(JobResponse::NotRunning), "NOT_RUNNING\r\n");
    }

    #[test]
    fn test_ok_ids_carries_yaml_list() {
        assert_eq!(
            wire(JobResponse::OkIds { ids: vec![1, 2] }),
            "OK 8\r\n- 1\n- 2\n\r\n"
        );
    }

    #[test]
    fn test_job_stats() {
        use chrono::TimeZone;

        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut job = Job::new(3, created, None);
        job.acquire_lease(created, chrono::Duration::seconds(300))
            .unwrap();
        job.start(created).unwrap();

        let now = created + chrono::Duration::seconds(100);
        let stats = JobStats::new(job, now, 0);

        assert_eq!(stats.age, 100);
        assert_eq!(stats.time_left, 200);
        assert_eq!(stats.delay, 0);
        assert_eq!(stats.attempts, 1);

        let text = wire(JobResponse::OkStatsJob { data: stats });
        assert!(text.starts_with("OK "));
        assert!(text.contains("state: running\n"));
        assert!(text.contains("time-left: 200\n"));
    }
}
