use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Which queues a worker group serves.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFilter {
    /// Every queue.
    #[default]
    All,
    /// Only the named queues.
    Include(Vec<String>),
    /// Every queue except the named ones.
    Exclude(Vec<String>),
    /// Only the named queues, served in list order before priority.
    Ordered(Vec<String>),
}

impl QueueFilter {
    pub fn matches(&self, queue_name: &str) -> bool {
        match self {
            QueueFilter::All => true,
            QueueFilter::Include(names) | QueueFilter::Ordered(names) => {
                names.iter().any(|name| name == queue_name)
            }
            QueueFilter::Exclude(names) => !names.iter().any(|name| name == queue_name),
        }
    }

    /// Position of the queue in an ordered filter.
    pub fn rank(&self, queue_name: &str) -> Option<usize> {
        match self {
            QueueFilter::Ordered(names) => names.iter().position(|name| name == queue_name),
            _ => None,
        }
    }

    /// Queue names listed by the filter, if any.
    pub fn names(&self) -> &[String] {
        match self {
            QueueFilter::All => &[],
            QueueFilter::Include(names)
            | QueueFilter::Exclude(names)
            | QueueFilter::Ordered(names) => names,
        }
    }
}

impl FromStr for QueueFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("queue filter must not be empty");
        }
        if s == "*" {
            return Ok(QueueFilter::All);
        }

        let (make, rest): (fn(Vec<String>) -> QueueFilter, &str) =
            if let Some(rest) = s.strip_prefix('-') {
                (QueueFilter::Exclude, rest)
            } else if let Some(rest) = s.strip_prefix('+') {
                (QueueFilter::Ordered, rest)
            } else {
                (QueueFilter::Include, s)
            };

        let names: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            anyhow::bail!("queue filter {s:?} names no queues");
        }
        if names.iter().any(|name| name == "*") {
            anyhow::bail!("queue filter {s:?} mixes '*' with queue names");
        }
        Ok(make(names))
    }
}

impl fmt::Display for QueueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueFilter::All => f.write_str("*"),
            QueueFilter::Include(names) => f.write_str(&names.join(",")),
            QueueFilter::Exclude(names) => write!(f, "-{}", names.join(",")),
            QueueFilter::Ordered(names) => write!(f, "+{}", names.join(",")),
        }
    }
}

/// One worker pool: a queue filter and its thread cap.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueGroup {
    pub filter: QueueFilter,
    pub max_threads: usize,
}

impl fmt::Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filter, self.max_threads)
    }
}

/// Parse `group(;group)*` where a group is `names[:max_threads]`.
///
/// Groups without an explicit thread count get `default_threads`.
pub fn parse_queue_groups(spec: &str, default_threads: usize) -> anyhow::Result<Vec<QueueGroup>> {
    let mut groups = Vec::new();
    for raw in spec.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let (names, threads) = match raw.rsplit_once(':') {
            Some((names, threads)) => {
                let threads: usize = threads
                    .trim()
                    .parse()
                    .map_err(|err| anyhow::anyhow!("invalid thread count in {raw:?}: {err}"))?;
                (names, threads)
            }
            None => (raw, default_threads),
        };
        if threads == 0 {
            anyhow::bail!("queue group {raw:?} must run at least one thread");
        }
        groups.push(QueueGroup {
            filter: names.parse()?,
            max_threads: threads,
        });
    }

    if groups.is_empty() {
        anyhow::bail!("no queue groups configured");
    }
    Ok(groups)
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-queue job counts.
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    /// Get or create the entry for a queue.
    pub fn entry_mut(&mut self, queue_name: &str) -> &mut QueueSnapshotEntry {
        self.queues.entry(queue_name.to_string()).or_default()
    }
}

/// Job counts for a single queue.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub scheduled: usize,
    pub queued: usize,
    pub running: usize,
    pub retried: usize,
    pub succeeded: usize,
    pub discarded: usize,
}

impl QueueSnapshotEntry {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Scheduled => self.scheduled += count,
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Retried => self.retried += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Discarded => self.discarded += count,
        }
    }

    /// Jobs that have not finished.
    pub fn pending(&self) -> usize {
        self.scheduled + self.queued + self.running + self.retried
    }

    pub fn total(&self) -> usize {
        self.pending() + self.succeeded + self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parsing() {
        assert_eq!("*".parse::<QueueFilter>().unwrap(), QueueFilter::All);
        assert_eq!(
            "mice, elephants".parse::<QueueFilter>().unwrap(),
            QueueFilter::Include(vec!["mice".into(), "elephants".into()])
        );
        assert_eq!(
            "-mice".parse::<QueueFilter>().unwrap(),
            QueueFilter::Exclude(vec!["mice".into()])
        );
        assert_eq!(
            "+high,low".parse::<QueueFilter>().unwrap(),
            QueueFilter::Ordered(vec!["high".into(), "low".into()])
        );
        assert!("".parse::<QueueFilter>().is_err());
        assert!("-".parse::<QueueFilter>().is_err());
        assert!("a,*".parse::<QueueFilter>().is_err());
    }

    #[test]
    fn test_filter_matching_and_rank() {
        let exclude: QueueFilter = "-mice".parse().unwrap();
        assert!(exclude.matches("elephants"));
        assert!(!exclude.matches("mice"));

        let ordered: QueueFilter = "+high,low".parse().unwrap();
        assert!(ordered.matches("low"));
        assert!(!ordered.matches("default"));
        assert_eq!(ordered.rank("high"), Some(0));
        assert_eq!(ordered.rank("low"), Some(1));
        assert_eq!(QueueFilter::All.rank("high"), None);
    }

    #[test]
    fn test_filter_display_round_trips() {
        for spec in ["*", "a,b", "-a,b", "+a,b"] {
            assert_eq!(spec.parse::<QueueFilter>().unwrap().to_string(), spec);
        }
    }

    #[test]
    fn test_parse_queue_groups() {
        let groups = parse_queue_groups("mice:2; elephants,lions:4; *", 5).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].max_threads, 2);
        assert_eq!(
            groups[1].filter,
            QueueFilter::Include(vec!["elephants".into(), "lions".into()])
        );
        assert_eq!(groups[2].filter, QueueFilter::All);
        assert_eq!(groups[2].max_threads, 5);

        assert!(parse_queue_groups("mice:0", 5).is_err());
        assert!(parse_queue_groups("mice:lots", 5).is_err());
        assert!(parse_queue_groups(" ; ", 5).is_err());
    }

    #[test]
    fn test_snapshot_entry_counts() {
        let mut snapshot = QueueSnapshot::new(Utc::now());
        let entry = snapshot.entry_mut("default");
        entry.add(JobStatus::Queued, 3);
        entry.add(JobStatus::Running, 1);
        entry.add(JobStatus::Succeeded, 5);
        assert_eq!(entry.pending(), 4);
        assert_eq!(entry.total(), 9);
    }
}
