//! Serves a [`JobService`] over the line-based control protocol.
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{InvalidTransition, JobError, JobResult, StoreError};
use crate::line_reader::{Body, LineReader};
use crate::parser::ParsingError;
use crate::service::JobService;
use crate::types::job::{Job, JobId};
use crate::types::protocol::{JobCommand, JobResponse, JobStats, ServerStats};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

pub const DEFAULT_MAX_LOG_SIZE: u32 = 65535;

impl From<JobError> for JobResponse {
    fn from(error: JobError) -> Self {
        match error {
            JobError::InvalidTransition(InvalidTransition { from, to }) => {
                JobResponse::InvalidTransition { from, to }
            },
            JobError::LeaseHeld { .. } => JobResponse::LeaseHeld,
            JobError::NotRunning { .. } => JobResponse::NotRunning,
            JobError::NotReady(_) => JobResponse::NotReady,
            JobError::Conflict(_)
            | JobError::StaleAttempt { .. }
            | JobError::Store(StoreError::RevisionMismatch { .. }) => {
                JobResponse::Conflict
            },
            JobError::Store(StoreError::NotFound(_)) => JobResponse::NotFound,
            JobError::Store(StoreError::SelfDependency(_)) => {
                JobResponse::SelfDependency
            },
            JobError::Store(StoreError::Cycle { .. }) => JobResponse::Cycle,
        }
    }
}

fn claimed(job: Job) -> JobResponse {
    JobResponse::Claimed {
        id: job.id,
        attempt: job.attempt_count,
    }
}

/// Decrements the open connection count when a connection ends.
struct ConnectionGuard<'a>(&'a AtomicU64);

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Server {
    service: Arc<JobService>,
    max_log_size: u32,
    started: Instant,
    current_connections: AtomicU64,
    total_connections: AtomicU64,
}

impl Server {
    pub fn new(service: Arc<JobService>, max_log_size: u32) -> Self {
        Self {
            service,
            max_log_size,
            started: Instant::now(),
            current_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &Arc<JobService> {
        &self.service
    }

    fn stats_job(&self, id: JobId) -> JobResult<JobResponse> {
        let job = self.service.get(id)?;
        let pending = self.service.pending_prerequisites(id)?.len() as u64;
        Ok(JobResponse::OkStatsJob {
            data: JobStats::new(job, self.service.now(), pending),
        })
    }

    fn stats_server(&self) -> JobResult<JobResponse> {
        Ok(JobResponse::OkStats {
            data: ServerStats {
                jobs: self.service.counts()?,
                current_connections: self
                    .current_connections
                    .load(Ordering::Relaxed),
                total_connections: self
                    .total_connections
                    .load(Ordering::Relaxed),
                default_lease: self
                    .service
                    .config()
                    .lease_duration
                    .num_seconds(),
                max_log_size: self.max_log_size,
                pid: std::process::id(),
                version: env!("CARGO_PKG_VERSION"),
                uptime: self.started.elapsed().as_secs(),
            },
        })
    }

    fn respond(result: JobResult<JobResponse>) -> JobResponse {
        result.unwrap_or_else(|error| {
            if let JobError::InvalidTransition(_) = error {
                // Callers should never ask for this; their view of the job
                // has diverged from the store's.
                warn!(%error, "rejected status transition");
            } else {
                debug!(%error, "command failed");
            }
            error.into()
        })
    }

    /// Executes every command that needs nothing beyond its own line.
    pub fn dispatch(&self, cmd: JobCommand) -> JobResponse {
        use JobCommand::*;

        let svc = &self.service;
        let result = match cmd {
            Create { delay } => {
                let scheduled_start = (delay > 0)
                    .then(|| svc.now() + Duration::seconds(delay.into()));
                svc.create(scheduled_start)
                    .map(|job| JobResponse::Created { id: job.id })
            },
            Start { id } => svc.start(id).map(|_| JobResponse::Started),
            Complete { id, attempt } => {
                svc.complete(id, attempt).map(|_| JobResponse::Completed)
            },
            Fail { id, attempt } => {
                svc.fail(id, attempt).map(|_| JobResponse::Failed)
            },
            Queue { id, attempt } => {
                svc.queue(id, attempt).map(|_| JobResponse::Queued)
            },
            Claim { id } => svc.claim(id).map(claimed),
            ClaimNext => svc
                .claim_next()
                .map(|job| job.map_or(JobResponse::NoJobs, claimed)),
            Lease { id, seconds } => {
                let duration =
                    (seconds > 0).then(|| Duration::seconds(seconds.into()));
                svc.acquire_lease(id, duration).map(|_| JobResponse::Leased)
            },
            Renew {
                id,
                seconds,
                attempt,
            } => {
                let duration =
                    (seconds > 0).then(|| Duration::seconds(seconds.into()));
                svc.renew_lease(id, duration, attempt)
                    .map(|_| JobResponse::Renewed)
            },
            AddPrerequisite {
                dependant,
                prerequisite,
            } => svc.add_prerequisite(dependant, prerequisite).map(|added| {
                if added {
                    JobResponse::Added
                } else {
                    JobResponse::AlreadyPresent
                }
            }),
            RemovePrerequisite {
                dependant,
                prerequisite,
            } => svc.remove_prerequisite(dependant, prerequisite).map(
                |removed| {
                    if removed {
                        JobResponse::Removed
                    } else {
                        JobResponse::NotFound
                    }
                },
            ),
            Prerequisites { id } => {
                svc.prerequisites(id).map(|ids| JobResponse::OkIds { ids })
            },
            Dependants { id } => {
                svc.dependants(id).map(|ids| JobResponse::OkIds { ids })
            },
            ListReady => svc.ready_jobs().map(|jobs| JobResponse::OkIds {
                ids: jobs.iter().map(|job| job.id).collect(),
            }),
            RequeueExpired => svc
                .requeue_expired()
                .map(|ids| JobResponse::Requeued { count: ids.len() }),
            Destroy { id } => svc.destroy(id).map(|()| JobResponse::Destroyed),
            StatsJob { id } => self.stats_job(id),
            StatsServer => self.stats_server(),
            Log { .. } | Quit => {
                error!(?cmd, "connection-level command reached dispatch");
                Ok(JobResponse::InternalError)
            },
        };

        Self::respond(result)
    }

    /// Appends a `log` body to the job's log.
    pub fn append_log(&self, id: JobId, body: &[u8]) -> JobResponse {
        let text = String::from_utf8_lossy(body);
        Self::respond(
            self.service
                .append_log(id, &text)
                .map(|_| JobResponse::Logged),
        )
    }

    /// Runs the protocol over one connection until the client quits or
    /// disconnects, or `cancel` fires.
    pub async fn handle_conn<R, W>(
        &self,
        cancel: CancellationToken,
        reader: R,
        mut w: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let _guard = ConnectionGuard(&self.current_connections);

        let mut r: LineReader<_> = reader.into();

        loop {
            let line = select!(
                x = r.read_line() => match x {
                    Ok(Some(x)) => x,
                    Ok(None) => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        // The stream can't be resynchronised, so say why and
                        // hang up.
                        let resp = ParsingError::BadFormat.serialise_wire();
                        w.write_all(&resp).await?;
                        w.flush().await?;
                        return Ok(());
                    },
                    Err(e) => return Err(e.into()),
                },
                _ = cancel.cancelled() => return Ok(()),
            );

            trace!(line = bytes_to_human_str(&line), "processing command");

            let cmd: Result<JobCommand, ParsingError> =
                (&line as &[u8]).try_into();

            let (resp, hang_up) = match cmd {
                Ok(JobCommand::Quit) => return Ok(()),
                Ok(JobCommand::Log { id, n_bytes }) => {
                    if n_bytes > self.max_log_size {
                        // The body isn't read, so the stream is out of sync.
                        (JobResponse::LogTooBig.serialise_wire(), true)
                    } else {
                        let body = select! {
                            x = r.read_body(n_bytes as usize) => x?,
                            _ = cancel.cancelled() => return Ok(()),
                        };
                        let resp = match body {
                            Some(Body::Data(body)) => {
                                self.append_log(id, &body)
                            },
                            Some(Body::MissingCrlf) => {
                                JobResponse::ExpectedCrlf
                            },
                            None => return Ok(()),
                        };
                        (resp.serialise_wire(), false)
                    }
                },
                Ok(cmd) => (self.dispatch(cmd).serialise_wire(), false),
                Err(error) => (error.serialise_wire(), false),
            };

            select! {
                x = w.write_all(&resp) => x?,
                _ = cancel.cancelled() => return Ok(()),
            };

            // Flush once per command so pipelined requests get pipelined
            // responses.
            select! {
                x = w.flush() => x?,
                _ = cancel.cancelled() => return Ok(()),
            };

            if hang_up {
                return Ok(());
            }
        }
    }
}
