use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::QuayConfig;
use crate::job::PriorityOrder;
use crate::queue::QueueGroup;
use crate::scheduler::SchedulerConfig;

/// Settings of the worker pool serving one queue group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name used in logs, stats and the process row.
    pub name: String,
    pub group: QueueGroup,
    pub order: PriorityOrder,
    pub select_limit: Option<usize>,
    pub idle_wake_interval_ms: u64,
    pub max_cache: usize,
}

impl WorkerConfig {
    /// Create a configuration for `group` with default timing.
    pub fn new(group: QueueGroup) -> Self {
        Self {
            name: group.to_string(),
            group,
            order: PriorityOrder::default(),
            select_limit: None,
            idle_wake_interval_ms: 5_000,
            max_cache: 10_000,
        }
    }

    /// One configuration per queue group of `config`.
    pub fn from_config(config: &QuayConfig) -> anyhow::Result<Vec<Self>> {
        Ok(config
            .queue_groups()?
            .into_iter()
            .map(|group| Self {
                order: config.priority_order,
                select_limit: config.queue_select_limit,
                idle_wake_interval_ms: config.idle_wake_interval_ms,
                max_cache: config.max_cache,
                ..Self::new(group)
            })
            .collect())
    }

    /// Set the idle-capacity timer period.
    pub fn with_idle_wake_interval(mut self, ms: u64) -> Self {
        self.idle_wake_interval_ms = ms;
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_threads: self.group.max_threads,
            idle_wake_interval: Duration::from_millis(self.idle_wake_interval_ms),
            max_cache: self.max_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_worker_config_per_group() {
        let config = QuayConfig::default()
            .with_queues("+critical,default:4;*")
            .with_max_threads(2)
            .with_priority_order(PriorityOrder::LargerFirst)
            .with_queue_select_limit(50);
        let workers = WorkerConfig::from_config(&config).unwrap();

        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].name, "+critical,default:4");
        assert_eq!(workers[0].scheduler_config().max_threads, 4);
        assert_eq!(workers[1].scheduler_config().max_threads, 2);
        assert!(workers.iter().all(|w| w.order == PriorityOrder::LargerFirst));
        assert!(workers.iter().all(|w| w.select_limit == Some(50)));
    }
}
