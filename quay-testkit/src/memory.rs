use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quay::*;

/// In-memory backend with the same observable behaviour as the Postgres one.
///
/// Row locks live in a [`MemoryLockTable`], so a [`MemoryLockSession`]
/// dropped mid-job releases the job exactly like a lost connection would.
#[derive(Debug)]
pub struct MemoryStore {
    locks: Arc<MemoryLockTable>,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    // Insertion sequence breaks ties between jobs created in the same instant.
    next_seq: u64,
    jobs: HashMap<JobId, (u64, JobRecord)>,
    executions: HashMap<JobId, Vec<ExecutionRecord>>,
    batches: HashMap<BatchId, BatchRecord>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
    settings: HashMap<String, serde_json::Value>,
}

impl State {
    fn insert(&mut self, job: NewJob, now: DateTime<Utc>) -> InsertOutcome {
        if let (Some(key), Some(at)) = (&job.cron_key, job.cron_at) {
            let duplicate = self.jobs.values().any(|(_, existing)| {
                existing.cron_key.as_deref() == Some(key.as_str()) && existing.cron_at == Some(at)
            });
            if duplicate {
                return InsertOutcome::Duplicate;
            }
        }

        let record = job.into_record(now);
        self.next_seq += 1;
        self.jobs.insert(record.id, (self.next_seq, record.clone()));
        InsertOutcome::Inserted(record)
    }

    fn job_mut(&mut self, id: JobId) -> anyhow::Result<&mut JobRecord> {
        self.jobs
            .get_mut(&id)
            .map(|(_, job)| job)
            .ok_or_else(|| anyhow::anyhow!("job {id} not found"))
    }

    fn pauses(&self) -> anyhow::Result<Pauses> {
        match self.settings.get(PAUSES_KEY) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Pauses::default()),
        }
    }

    fn batch_finished(&self, id: BatchId) -> bool {
        self.batches.get(&id).is_none_or(BatchRecord::is_finished)
    }
}

fn dequeue_order(
    filter: &QueueFilter,
    order: PriorityOrder,
    a: &(u64, JobRecord),
    b: &(u64, JobRecord),
) -> Ordering {
    let rank = |job: &JobRecord| filter.rank(&job.queue_name).unwrap_or(0);
    rank(&a.1)
        .cmp(&rank(&b.1))
        .then_with(|| order.compare(a.1.priority, b.1.priority))
        .then_with(|| a.1.created_at.cmp(&b.1.created_at))
        .then_with(|| a.0.cmp(&b.0))
}

fn succeeded(job: &JobRecord) -> bool {
    job.error.is_none() || job.error_event == Some(ErrorEvent::Handled)
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            locks: MemoryLockTable::new(),
            state: Mutex::new(State::default()),
        })
    }

    /// The lock table backing every session of this store.
    pub fn lock_table(&self) -> &Arc<MemoryLockTable> {
        &self.locks
    }

    /// Every job, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let state = self.state.lock();
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.state.lock().jobs.get(&id).map(|(_, job)| job.clone())
    }

    /// Jobs of one class, oldest first.
    pub fn jobs_of_class(&self, job_class: &str) -> Vec<JobRecord> {
        self.jobs()
            .into_iter()
            .filter(|job| job.job_class == job_class)
            .collect()
    }

    pub fn unfinished_count(&self) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|(_, job)| !job.is_finished())
            .count()
    }

    /// Rewrite a stored job, e.g. to make a scheduled retry due now.
    pub fn update_job(&self, id: JobId, update: impl FnOnce(&mut JobRecord)) -> bool {
        match self.state.lock().jobs.get_mut(&id) {
            Some((_, job)) => {
                update(job);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    type Session = MemoryLockSession;

    async fn session(&self) -> anyhow::Result<Self::Session> {
        Ok(self.locks.session())
    }

    async fn insert_job(&self, job: NewJob) -> anyhow::Result<InsertOutcome> {
        Ok(self.state.lock().insert(job, Utc::now()))
    }

    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<InsertOutcome>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        Ok(jobs.into_iter().map(|job| state.insert(job, now)).collect())
    }

    async fn find_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.job(id))
    }

    async fn claim(
        &self,
        session: &mut Self::Session,
        request: &ClaimRequest,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let candidates = {
            let state = self.state.lock();
            let pauses = state.pauses()?;
            let mut candidates: Vec<_> = state
                .jobs
                .values()
                .filter(|(_, job)| {
                    !job.is_finished()
                        && job.is_due(request.now)
                        && request.filter.matches(&job.queue_name)
                        && !pauses.blocks(job)
                })
                .cloned()
                .collect();
            candidates.sort_by(|a, b| dequeue_order(&request.filter, request.order, a, b));
            if let Some(select_limit) = request.select_limit {
                candidates.truncate(select_limit);
            }
            candidates
        };

        let mut claimed = Vec::new();
        for (_, job) in candidates {
            if claimed.len() >= request.limit {
                break;
            }
            if session.try_lock(&job.lock_key()).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn begin_execution(
        &self,
        begin: BeginExecution,
    ) -> anyhow::Result<(JobRecord, ExecutionRecord)> {
        let mut state = self.state.lock();
        let job = state.job_mut(begin.job_id)?;
        job.performed_at = Some(begin.performed_at);
        job.locked_by_id = begin.process_id;
        job.locked_at = Some(begin.performed_at);
        job.executions_count += 1;
        let job = job.clone();

        let execution = ExecutionRecord {
            id: begin.execution_id,
            job_id: job.id,
            job_class: job.job_class.clone(),
            queue_name: job.queue_name.clone(),
            serialized_params: job.serialized_params.clone(),
            scheduled_at: job.scheduled_at,
            performed_at: begin.performed_at,
            finished_at: None,
            error: None,
            error_event: None,
            process_id: begin.process_id,
            duration: None,
            retried_execution_id: None,
            created_at: begin.performed_at,
        };

        let executions = state.executions.entry(job.id).or_default();
        for previous in executions.iter_mut().filter(|e| e.is_head()) {
            previous.retried_execution_id = Some(begin.execution_id);
        }
        executions.push(execution.clone());
        Ok((job, execution))
    }

    async fn interrupt_execution(
        &self,
        job_id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<JobRecord> {
        let mut state = self.state.lock();
        if let Some(head) = state
            .executions
            .get_mut(&job_id)
            .and_then(|executions| {
                executions
                    .iter_mut()
                    .find(|e| e.is_head() && e.finished_at.is_none())
            })
        {
            head.finished_at = Some(at);
            head.error = Some(error.to_string());
            head.error_event = Some(ErrorEvent::Interrupted);
            head.duration = Some(at - head.performed_at);
        }

        let job = state.job_mut(job_id)?;
        job.performed_at = None;
        job.error = Some(error.to_string());
        job.error_event = Some(ErrorEvent::Interrupted);
        job.locked_by_id = None;
        job.locked_at = None;
        Ok(job.clone())
    }

    async fn finish_execution(&self, finish: FinishExecution) -> anyhow::Result<JobRecord> {
        let mut state = self.state.lock();
        if let Some(execution) = state
            .executions
            .get_mut(&finish.job_id)
            .and_then(|executions| executions.iter_mut().find(|e| e.id == finish.execution_id))
        {
            execution.finished_at = Some(finish.finished_at);
            execution.error = finish.error.clone();
            execution.error_event = finish.error_event;
            execution.duration = Some(finish.duration);
        }

        let job = state.job_mut(finish.job_id)?;
        job.error = finish.error;
        job.error_event = finish.error_event;
        job.locked_by_id = None;
        job.locked_at = None;
        match finish.retry_at {
            Some(at) => {
                job.scheduled_at = Some(at);
                job.performed_at = None;
                job.finished_at = None;
            }
            None => job.finished_at = Some(finish.finished_at),
        }
        Ok(job.clone())
    }

    async fn executions(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionRecord>> {
        Ok(self
            .state
            .lock()
            .executions
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_job(&self, job_id: JobId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        state.executions.remove(&job_id);
        Ok(state.jobs.remove(&job_id).is_some())
    }

    async fn count_concurrency(&self, key: &str, count: ConcurrencyCount) -> anyhow::Result<u64> {
        let state = self.state.lock();
        let keyed = state
            .jobs
            .values()
            .map(|(_, job)| job)
            .filter(|job| job.concurrency_key.as_deref() == Some(key));

        let total = match count {
            ConcurrencyCount::Unfinished => keyed.filter(|job| !job.is_finished()).count(),
            ConcurrencyCount::Enqueued => keyed
                .filter(|job| !job.is_finished() && !self.locks.is_locked(&job.lock_key()))
                .count(),
            ConcurrencyCount::Performing => keyed
                .filter(|job| !job.is_finished() && self.locks.is_locked(&job.lock_key()))
                .count(),
            ConcurrencyCount::CreatedSince(since) => {
                keyed.filter(|job| job.created_at >= since).count()
            }
            ConcurrencyCount::PerformedSince(since) => keyed
                .filter_map(|job| state.executions.get(&job.id))
                .flatten()
                .filter(|execution| {
                    execution.performed_at >= since
                        && !execution
                            .error
                            .as_deref()
                            .is_some_and(is_rejection_message)
                })
                .count(),
        };
        Ok(total as u64)
    }

    async fn upcoming_scheduled(
        &self,
        filter: &QueueFilter,
        after: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let state = self.state.lock();
        let mut times: Vec<_> = state
            .jobs
            .values()
            .map(|(_, job)| job)
            .filter(|job| !job.is_finished() && filter.matches(&job.queue_name))
            .filter_map(|job| job.scheduled_at)
            .filter(|at| *at > after)
            .collect();
        times.sort();
        times.truncate(limit);
        Ok(times)
    }

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> anyhow::Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(now);
        for (_, job) in state.jobs.values() {
            snapshot.entry_mut(&job.queue_name).add(job.status(now), 1);
        }
        Ok(snapshot)
    }

    async fn purge_finished(&self, request: PurgeRequest) -> anyhow::Result<PurgeStats> {
        let mut state = self.state.lock();
        let mut doomed: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .map(|(_, job)| job)
            .filter(|job| {
                job.finished_at
                    .is_some_and(|at| at < request.finished_before)
                    && (request.include_discarded || succeeded(job))
                    && job.batch_id.is_none_or(|id| state.batch_finished(id))
            })
            .filter_map(|job| job.finished_at.map(|at| (at, job.id)))
            .collect();
        doomed.sort();
        doomed.truncate(request.limit);

        let mut stats = PurgeStats::default();
        for (_, id) in doomed {
            if state.jobs.remove(&id).is_some() {
                stats.jobs += 1;
            }
            if let Some(executions) = state.executions.remove(&id) {
                stats.executions += executions.len() as u64;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn insert_batch(&self, batch: BatchRecord) -> anyhow::Result<BatchRecord> {
        self.state.lock().batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn find_batch(&self, id: BatchId) -> anyhow::Result<Option<BatchRecord>> {
        Ok(self.state.lock().batches.get(&id).cloned())
    }

    async fn save_batch_properties(
        &self,
        id: BatchId,
        properties: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("batch {id} not found"))?;
        batch.serialized_properties = properties;
        Ok(())
    }

    async fn transition_batch(
        &self,
        id: BatchId,
        transition: BatchTransition,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(self
            .state
            .lock()
            .batches
            .get_mut(&id)
            .is_some_and(|batch| batch.apply(transition, at)))
    }

    async fn count_unfinished_in_batch(&self, id: BatchId) -> anyhow::Result<u64> {
        let state = self.state.lock();
        let count = state
            .jobs
            .values()
            .filter(|(_, job)| job.batch_id == Some(id) && !job.is_finished())
            .count();
        Ok(count as u64)
    }

    async fn batch_jobs(&self, id: BatchId) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self
            .jobs()
            .into_iter()
            .filter(|job| job.batch_id == Some(id))
            .collect())
    }

    async fn purge_batches(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let doomed: Vec<BatchId> = state
            .batches
            .values()
            .filter(|batch| batch.finished_at.is_some_and(|at| at < finished_before))
            .filter(|batch| {
                !state
                    .jobs
                    .values()
                    .any(|(_, job)| job.batch_id == Some(batch.id))
            })
            .map(|batch| batch.id)
            .collect();
        for id in &doomed {
            state.batches.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn register_process(&self, process: ProcessRecord) -> anyhow::Result<()> {
        self.state.lock().processes.insert(process.id, process);
        Ok(())
    }

    async fn heartbeat(&self, id: ProcessId, at: DateTime<Utc>) -> anyhow::Result<bool> {
        Ok(match self.state.lock().processes.get_mut(&id) {
            Some(process) => {
                process.last_heartbeat_at = at;
                true
            }
            None => false,
        })
    }

    async fn deregister_process(&self, id: ProcessId) -> anyhow::Result<()> {
        self.state.lock().processes.remove(&id);
        Ok(())
    }

    async fn list_processes(&self) -> anyhow::Result<Vec<ProcessRecord>> {
        Ok(self.state.lock().processes.values().cloned().collect())
    }

    async fn delete_stale_processes(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let before_len = state.processes.len();
        state
            .processes
            .retain(|_, process| process.last_heartbeat_at >= before);
        Ok((before_len - state.processes.len()) as u64)
    }
}

#[async_trait]
impl SettingStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.state.lock().settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        self.state.lock().settings.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().settings.remove(key).is_some())
    }
}
