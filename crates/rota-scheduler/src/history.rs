//! Bounded run history, most recent first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::runs::{JobRun, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHistory {
    runs: VecDeque<JobRun>,
}

impl JobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from runs in any order.
    pub fn from_runs(mut runs: Vec<JobRun>) -> Self {
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Self { runs: runs.into() }
    }

    pub fn push_front(&mut self, run: JobRun) {
        self.runs.push_front(run);
    }

    /// Drop runs beyond `bound`, oldest first, and return them.
    pub fn prune(&mut self, bound: usize) -> Vec<JobRun> {
        let bound = bound.max(1);
        if self.runs.len() <= bound {
            return Vec::new();
        }
        self.runs.split_off(bound).into()
    }

    pub fn get(&self, run_id: u64) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn latest(&self) -> Option<&JobRun> {
        self.runs.front()
    }

    /// The run before the latest one.
    pub fn previous(&self) -> Option<&JobRun> {
        self.runs.get(1)
    }

    /// Length of the failure streak ending at the latest run.
    pub fn consecutive_failures(&self) -> u32 {
        self.runs
            .iter()
            .take_while(|r| r.status == RunStatus::Failed)
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter()
    }

    pub fn run_ids(&self) -> Vec<u64> {
        self.runs.iter().map(|r| r.run_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: u64, status: RunStatus) -> JobRun {
        let mut run = JobRun::new("backup", id, Vec::new());
        run.status = status;
        run
    }

    #[test]
    fn test_bound_keeps_most_recent() {
        let mut history = JobHistory::new();
        let mut evicted = Vec::new();
        for id in 1..=7 {
            history.push_front(run(id, RunStatus::Succeeded));
            evicted.extend(history.prune(3).into_iter().map(|r| r.run_id));
        }
        assert_eq!(history.run_ids(), vec![7, 6, 5]);
        assert_eq!(evicted, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_from_runs_sorts_descending() {
        let history = JobHistory::from_runs(vec![
            run(2, RunStatus::Failed),
            run(9, RunStatus::Succeeded),
            run(4, RunStatus::Failed),
        ]);
        assert_eq!(history.run_ids(), vec![9, 4, 2]);
        assert_eq!(history.latest().unwrap().run_id, 9);
        assert_eq!(history.previous().unwrap().run_id, 4);
        assert!(history.get(4).is_some());
        assert!(history.get(5).is_none());
    }

    #[test]
    fn test_consecutive_failures() {
        let mut history = JobHistory::new();
        assert_eq!(history.consecutive_failures(), 0);
        history.push_front(run(1, RunStatus::Failed));
        history.push_front(run(2, RunStatus::Succeeded));
        history.push_front(run(3, RunStatus::Failed));
        history.push_front(run(4, RunStatus::Failed));
        assert_eq!(history.consecutive_failures(), 2);
    }
}
