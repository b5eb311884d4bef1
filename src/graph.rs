//! Prerequisite/dependant edges between jobs.
use std::collections::{BTreeSet, HashSet};

use crate::types::dependency::JobDependency;
use crate::types::job::JobId;

/// The set of dependency edges, indexed both ways.
///
/// Lookups only follow direct edges. Transitive walks are used solely to keep
/// the graph acyclic when edges are added.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    /// (prerequisite, dependant)
    forward: BTreeSet<(JobId, JobId)>,
    /// (dependant, prerequisite)
    backward: BTreeSet<(JobId, JobId)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn contains(&self, edge: JobDependency) -> bool {
        self.forward.contains(&(edge.prerequisite, edge.dependant))
    }

    /// Inserts the edge, returning false if it was already present. Callers
    /// are expected to have ruled out self-loops and cycles.
    pub fn insert(&mut self, edge: JobDependency) -> bool {
        self.backward.insert((edge.dependant, edge.prerequisite));
        self.forward.insert((edge.prerequisite, edge.dependant))
    }

    pub fn remove(&mut self, edge: JobDependency) -> bool {
        self.backward.remove(&(edge.dependant, edge.prerequisite));
        self.forward.remove(&(edge.prerequisite, edge.dependant))
    }

    /// Jobs that `id` directly waits on.
    pub fn prerequisites(&self, id: JobId) -> Vec<JobId> {
        self.backward
            .range((id, JobId::MIN)..=(id, JobId::MAX))
            .map(|(_, prerequisite)| *prerequisite)
            .collect()
    }

    /// Jobs that directly wait on `id`.
    pub fn dependants(&self, id: JobId) -> Vec<JobId> {
        self.forward
            .range((id, JobId::MIN)..=(id, JobId::MAX))
            .map(|(_, dependant)| *dependant)
            .collect()
    }

    /// Drops every edge with `id` at either end, returning how many went.
    pub fn remove_job(&mut self, id: JobId) -> usize {
        let edges: Vec<JobDependency> = self
            .prerequisites(id)
            .into_iter()
            .map(|p| JobDependency::new(p, id))
            .chain(
                self.dependants(id)
                    .into_iter()
                    .map(|d| JobDependency::new(id, d)),
            )
            .collect();

        for edge in &edges {
            self.remove(*edge);
        }
        edges.len()
    }

    /// Whether `to` can be reached from `from` by following dependant edges,
    /// i.e. whether `to` transitively waits on `from`.
    pub fn reaches(&self, from: JobId, to: JobId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];

        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.dependants(id));
            }
        }
        false
    }

    /// Whether adding `edge` would let a job transitively depend on itself.
    pub fn would_cycle(&self, edge: JobDependency) -> bool {
        edge.is_self_loop() || self.reaches(edge.dependant, edge.prerequisite)
    }

    pub fn edges(&self) -> impl Iterator<Item = JobDependency> + '_ {
        self.forward
            .iter()
            .map(|(prerequisite, dependant)| {
                JobDependency::new(*prerequisite, *dependant)
            })
    }
}

impl FromIterator<JobDependency> for DependencyGraph {
    fn from_iter<I: IntoIterator<Item = JobDependency>>(iter: I) -> Self {
        let mut graph = Self::new();
        for edge in iter {
            graph.insert(edge);
        }
        graph
    }
}
