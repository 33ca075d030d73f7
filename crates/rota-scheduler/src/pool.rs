//! Host selection for a run: single host, local, or a pool in sequential
//! (round-robin) or parallel mode.

use rota_core::{JobTarget, PoolMode};
use serde::{Deserialize, Serialize};

/// Host name used for jobs that run on the daemon host.
pub const LOCAL_HOST: &str = "localhost";

/// One host a run will execute on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    pub host: String,
    pub host_index: usize,
}

/// Round-robin cursor for sequential pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAllocator {
    #[serde(default)]
    pub cursor: usize,
}

impl HostAllocator {
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Targets for the next run. `pool_hosts` is the current host list of
    /// the job's pool and is ignored for host and local targets.
    pub fn resolve(&mut self, target: &JobTarget, pool_hosts: &[String]) -> Vec<RunTarget> {
        match target {
            JobTarget::Host { host } => vec![RunTarget {
                host: host.clone(),
                host_index: 0,
            }],
            JobTarget::Local => vec![RunTarget {
                host: LOCAL_HOST.to_string(),
                host_index: 0,
            }],
            JobTarget::Pool { .. } if pool_hosts.is_empty() => Vec::new(),
            JobTarget::Pool {
                mode: PoolMode::Sequential,
                ..
            } => {
                if self.cursor >= pool_hosts.len() {
                    self.cursor = 0;
                }
                let host = pool_hosts[self.cursor].clone();
                self.cursor += 1;
                vec![RunTarget { host, host_index: 0 }]
            }
            JobTarget::Pool {
                mode: PoolMode::Parallel,
                ..
            } => pool_hosts
                .iter()
                .enumerate()
                .map(|(host_index, host)| RunTarget {
                    host: host.clone(),
                    host_index,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(mode: PoolMode) -> JobTarget {
        JobTarget::Pool {
            pool: "web".into(),
            mode,
        }
    }

    fn hosts() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into()]
    }

    #[test]
    fn test_sequential_rotation_wraps() {
        let mut alloc = HostAllocator::default();
        let picked: Vec<String> = (0..4)
            .map(|_| alloc.resolve(&pool(PoolMode::Sequential), &hosts())[0].host.clone())
            .collect();
        assert_eq!(picked, vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn test_sequential_survives_pool_shrink() {
        let mut alloc = HostAllocator { cursor: 5 };
        let targets = alloc.resolve(&pool(PoolMode::Sequential), &hosts());
        assert_eq!(targets[0].host, "A");
        assert_eq!(alloc.cursor, 1);
    }

    #[test]
    fn test_parallel_takes_all_hosts() {
        let mut alloc = HostAllocator::default();
        let targets = alloc.resolve(&pool(PoolMode::Parallel), &hosts());
        assert_eq!(targets.len(), 3);
        assert_eq!(
            targets.iter().map(|t| t.host_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(alloc.cursor, 0);
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        let mut alloc = HostAllocator { cursor: 2 };
        assert!(alloc.resolve(&pool(PoolMode::Sequential), &[]).is_empty());
        assert!(alloc.resolve(&pool(PoolMode::Parallel), &[]).is_empty());
        assert_eq!(alloc.cursor, 2);
    }

    #[test]
    fn test_single_and_local_targets() {
        let mut alloc = HostAllocator::default();
        let single = alloc.resolve(&JobTarget::Host { host: "root@db1:22".into() }, &[]);
        assert_eq!(single, vec![RunTarget { host: "root@db1:22".into(), host_index: 0 }]);

        let local = alloc.resolve(&JobTarget::Local, &[]);
        assert_eq!(local[0].host, LOCAL_HOST);
    }
}
