use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{JobStore, Snapshot};
use crate::error::{SnapshotError, StoreError};
use crate::graph::DependencyGraph;
use crate::types::dependency::JobDependency;
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;

#[derive(Debug)]
struct Inner {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    graph: DependencyGraph,
}

impl Inner {
    fn require(&self, id: JobId) -> Result<&Job, StoreError> {
        self.jobs.get(&id).ok_or(StoreError::NotFound(id))
    }
}

/// A [`JobStore`] held entirely in memory, behind a single lock.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                jobs: BTreeMap::new(),
                graph: DependencyGraph::new(),
            }),
        }
    }

    /// Rebuilds a store from a snapshot. Edges whose endpoints are missing
    /// are dropped; duplicate jobs and cyclic edges reject the snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, SnapshotError> {
        let mut jobs = BTreeMap::new();
        for job in snapshot.jobs {
            let id = job.id;
            if jobs.insert(id, job).is_some() {
                return Err(SnapshotError::DuplicateJob(id));
            }
        }

        let mut graph = DependencyGraph::new();
        for edge in snapshot.dependencies {
            if !jobs.contains_key(&edge.prerequisite)
                || !jobs.contains_key(&edge.dependant)
            {
                warn!(?edge, "dropping dependency on a missing job");
                continue;
            }
            if graph.would_cycle(edge) {
                return Err(SnapshotError::Cycle {
                    prerequisite: edge.prerequisite,
                    dependant: edge.dependant,
                });
            }
            graph.insert(edge);
        }

        let next_id = jobs
            .keys()
            .next_back()
            .map_or(1, |id| id + 1)
            .max(snapshot.next_id);

        Ok(Self {
            inner: Mutex::new(Inner {
                next_id,
                jobs,
                graph,
            }),
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            next_id: inner.next_id,
            jobs: inner.jobs.values().cloned().collect(),
            dependencies: inner.graph.edges().collect(),
        }
    }
}

impl JobStore for MemoryStore {
    fn create(
        &self,
        date_created: DateTime<Utc>,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let job = Job::new(id, date_created, scheduled_start);
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner.lock().require(id).cloned()
    }

    fn find(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect())
    }

    fn save(&self, job: &Job) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;

        if stored.revision != job.revision {
            return Err(StoreError::RevisionMismatch {
                id: job.id,
                expected: job.revision,
                actual: stored.revision,
            });
        }

        *stored = job.clone();
        stored.revision += 1;
        trace!(id = job.id, revision = stored.revision, "saved job");
        Ok(stored.clone())
    }

    fn destroy(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.require(id)?;

        let edges = inner.graph.remove_job(id);
        inner.jobs.remove(&id);
        trace!(id, edges, "destroyed job");
        Ok(())
    }

    fn add_dependency(&self, edge: JobDependency) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.require(edge.prerequisite)?;
        inner.require(edge.dependant)?;

        if edge.is_self_loop() {
            return Err(StoreError::SelfDependency(edge.dependant));
        }
        if inner.graph.contains(edge) {
            return Ok(false);
        }
        if inner.graph.would_cycle(edge) {
            return Err(StoreError::Cycle {
                prerequisite: edge.prerequisite,
                dependant: edge.dependant,
            });
        }

        Ok(inner.graph.insert(edge))
    }

    fn remove_dependency(
        &self,
        edge: JobDependency,
    ) -> Result<bool, StoreError> {
        Ok(self.inner.lock().graph.remove(edge))
    }

    fn prerequisites(&self, id: JobId) -> Result<Vec<JobId>, StoreError> {
        let inner = self.inner.lock();
        inner.require(id)?;
        Ok(inner.graph.prerequisites(id))
    }

    fn dependants(&self, id: JobId) -> Result<Vec<JobId>, StoreError> {
        let inner = self.inner.lock();
        inner.require(id)?;
        Ok(inner.graph.dependants(id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let a = store.create(t(0), None).unwrap();
        let b = store.create(t(1), Some(t(10))).unwrap();

        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(a.status, JobStatus::Waiting);
        assert_eq!(b.scheduled_start, Some(t(10)));
        assert_eq!(store.get(2).unwrap(), b);
        assert_eq!(store.get(3), Err(StoreError::NotFound(3)));
    }

    #[test]
    fn test_save_is_compare_and_swap() {
        let store = MemoryStore::new();
        let job = store.create(t(0), None).unwrap();

        let mut first = job.clone();
        first.start(t(1)).unwrap();
        let mut second = job.clone();
        second.start(t(2)).unwrap();

        let saved = store.save(&first).unwrap();
        assert_eq!(saved.revision, 1);
        assert_eq!(
            store.save(&second),
            Err(StoreError::RevisionMismatch {
                id: job.id,
                expected: 0,
                actual: 1
            })
        );

        let stored = store.get(job.id).unwrap();
        assert_eq!(stored.date_started, Some(t(1)));
        assert_eq!(stored.attempt_count, 1);
    }

    #[test]
    fn test_find_by_status() {
        let store = MemoryStore::new();
        for n in 0..3 {
            store.create(t(n), None).unwrap();
        }
        let mut job = store.get(2).unwrap();
        job.start(t(5)).unwrap();
        store.save(&job).unwrap();

        let ids =
            |jobs: Vec<Job>| jobs.iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids(store.find(None).unwrap()), vec![1, 2, 3]);
        assert_eq!(
            ids(store.find(Some(JobStatus::Waiting)).unwrap()),
            vec![1, 3]
        );
        assert_eq!(ids(store.find(Some(JobStatus::Running)).unwrap()), vec![2]);
    }

    #[test]
    fn test_dependencies() {
        let store = MemoryStore::new();
        let j1 = store.create(t(0), None).unwrap().id;
        let j2 = store.create(t(0), None).unwrap().id;
        let j3 = store.create(t(0), None).unwrap().id;

        assert_eq!(store.add_dependency(JobDependency::new(j1, j2)), Ok(true));
        assert_eq!(store.add_dependency(JobDependency::new(j1, j2)), Ok(false));
        assert_eq!(store.add_dependency(JobDependency::new(j2, j3)), Ok(true));

        assert_eq!(store.prerequisites(j2).unwrap(), vec![j1]);
        assert_eq!(store.dependants(j1).unwrap(), vec![j2]);

        assert_eq!(
            store.add_dependency(JobDependency::new(j3, j1)),
            Err(StoreError::Cycle {
                prerequisite: j3,
                dependant: j1
            })
        );
        assert_eq!(
            store.add_dependency(JobDependency::new(j1, j1)),
            Err(StoreError::SelfDependency(j1))
        );
        assert_eq!(
            store.add_dependency(JobDependency::new(j1, 99)),
            Err(StoreError::NotFound(99))
        );

        assert_eq!(
            store.remove_dependency(JobDependency::new(j2, j3)),
            Ok(true)
        );
        assert_eq!(
            store.remove_dependency(JobDependency::new(j2, j3)),
            Ok(false)
        );
        assert!(store.prerequisites(j3).unwrap().is_empty());
    }

    #[test]
    fn test_destroy_removes_edges() {
        let store = MemoryStore::new();
        let j1 = store.create(t(0), None).unwrap().id;
        let j2 = store.create(t(0), None).unwrap().id;
        let j3 = store.create(t(0), None).unwrap().id;
        store.add_dependency(JobDependency::new(j1, j2)).unwrap();
        store.add_dependency(JobDependency::new(j2, j3)).unwrap();

        store.destroy(j2).unwrap();

        assert_eq!(store.get(j2), Err(StoreError::NotFound(j2)));
        assert!(store.dependants(j1).unwrap().is_empty());
        assert!(store.prerequisites(j3).unwrap().is_empty());
        assert!(store.snapshot().dependencies.is_empty());
        assert_eq!(store.destroy(j2), Err(StoreError::NotFound(j2)));
    }

    #[test]
    fn test_snapshot_restores_state() {
        let store = MemoryStore::new();
        let j1 = store.create(t(0), None).unwrap().id;
        let j2 = store.create(t(0), None).unwrap().id;
        store.add_dependency(JobDependency::new(j1, j2)).unwrap();
        store.destroy(j2).unwrap();
        let j3 = store.create(t(0), None).unwrap().id;
        store.add_dependency(JobDependency::new(j1, j3)).unwrap();

        let restored = MemoryStore::from_snapshot(store.snapshot()).unwrap();

        assert_eq!(restored.find(None).unwrap(), store.find(None).unwrap());
        assert_eq!(restored.dependants(j1).unwrap(), vec![j3]);
        // Ids are never reused, even for destroyed jobs.
        assert_eq!(restored.create(t(1), None).unwrap().id, 4);
    }

    #[test]
    fn test_snapshot_drops_dangling_edges() {
        let snapshot = Snapshot {
            next_id: 1,
            jobs: vec![Job::new(1, t(0), None)],
            dependencies: vec![JobDependency::new(1, 2)],
        };

        let store = MemoryStore::from_snapshot(snapshot).unwrap();

        assert!(store.dependants(1).unwrap().is_empty());
        assert_eq!(store.create(t(0), None).unwrap().id, 2);
    }

    #[test]
    fn test_snapshot_with_cycle_is_rejected() {
        let jobs = (1..=3).map(|id| Job::new(id, t(0), None)).collect();
        let snapshot = Snapshot {
            next_id: 4,
            jobs,
            dependencies: vec![
                JobDependency::new(1, 2),
                JobDependency::new(2, 3),
                JobDependency::new(3, 1),
            ],
        };

        assert!(matches!(
            MemoryStore::from_snapshot(snapshot),
            Err(SnapshotError::Cycle {
                prerequisite: 3,
                dependant: 1
            })
        ));

        let self_loop = Snapshot {
            next_id: 2,
            jobs: vec![Job::new(1, t(0), None)],
            dependencies: vec![JobDependency::new(1, 1)],
        };
        assert!(matches!(
            MemoryStore::from_snapshot(self_loop),
            Err(SnapshotError::Cycle { .. })
        ));
    }

    #[test]
    fn test_snapshot_with_duplicate_job_is_rejected() {
        let snapshot = Snapshot {
            next_id: 2,
            jobs: vec![Job::new(1, t(0), None), Job::new(1, t(5), None)],
            dependencies: Vec::new(),
        };

        assert!(matches!(
            MemoryStore::from_snapshot(snapshot),
            Err(SnapshotError::DuplicateJob(1))
        ));
    }
}
