use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use resotocore_types::{WorkerId, WorkerTaskDescription, WorkerTaskEnvelope, WorkerTaskId, WorkerTaskSpec};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

/// A task is abandoned after this many retries.
pub const MAX_RETRIES: u32 = 3;
const INBOUND_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerQueueError {
    #[error("worker {0} does not own task {1}")]
    NotOwner(WorkerId, WorkerTaskId),
    #[error("task {0} not found")]
    TaskNotFound(WorkerTaskId),
}

/// Completes a task's result future when retries are exhausted or the
/// worker reports an error after the last retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("worker task failed: {0}")]
pub struct WorkerFailure(pub String);

pub type WorkerResult = Result<Value, WorkerFailure>;

struct TaskRecord {
    id: WorkerTaskId,
    name: String,
    attrs: BTreeMap<String, String>,
    payload: Value,
    timeout: Duration,
    retry_counter: u32,
    assigned_worker: Option<WorkerId>,
    assigned_at: Instant,
    result_tx: Option<oneshot::Sender<WorkerResult>>,
}

impl TaskRecord {
    fn envelope(&self) -> WorkerTaskEnvelope {
        WorkerTaskEnvelope {
            id: self.id,
            name: self.name.clone(),
            attrs: self.attrs.clone(),
            data: self.payload.clone(),
        }
    }
}

struct WorkerEntry {
    descriptions: Vec<WorkerTaskDescription>,
    inbound: mpsc::Sender<WorkerTaskEnvelope>,
    outstanding_count: AtomicUsize,
    last_assigned_at: Mutex<Instant>,
}

/// Scoped registration: detach is guaranteed by `Drop`, which returns any
/// tasks still in-flight to this worker back to `unassigned`.
pub struct WorkerHandle {
    worker_id: WorkerId,
    queue: WorkerTaskQueue,
    inbound: mpsc::Receiver<WorkerTaskEnvelope>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn recv(&mut self) -> Option<WorkerTaskEnvelope> {
        self.inbound.recv().await
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.queue.detach(&self.worker_id);
    }
}

#[derive(Clone)]
pub struct WorkerTaskQueue {
    outstanding: Arc<DashMap<WorkerTaskId, TaskRecord>>,
    workers: Arc<DashMap<WorkerId, WorkerEntry>>,
    unassigned: Arc<Mutex<VecDeque<TaskRecord>>>,
}

impl Default for WorkerTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerTaskQueue {
    pub fn new() -> Self {
        Self {
            outstanding: Arc::new(DashMap::new()),
            workers: Arc::new(DashMap::new()),
            unassigned: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    #[instrument(skip(self, descriptions), fields(subsys = "WorkerTaskQueue"))]
    pub fn attach(
        &self,
        worker_id: WorkerId,
        descriptions: Vec<WorkerTaskDescription>,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                descriptions,
                inbound: tx,
                outstanding_count: AtomicUsize::new(0),
                last_assigned_at: Mutex::new(Instant::now()),
            },
        );
        self.promote_unassigned();
        WorkerHandle {
            worker_id,
            queue: self.clone(),
            inbound: rx,
        }
    }

    #[instrument(skip(self), fields(subsys = "WorkerTaskQueue"))]
    fn detach(&self, worker_id: &WorkerId) {
        if self.workers.remove(worker_id).is_none() {
            return;
        }

        let stuck: Vec<WorkerTaskId> = self
            .outstanding
            .iter()
            .filter(|entry| entry.assigned_worker.as_ref() == Some(worker_id))
            .map(|entry| entry.id)
            .collect();

        for id in stuck {
            if let Some((_, mut record)) = self.outstanding.remove(&id) {
                record.retry_counter += 1;
                record.assigned_worker = None;
                self.unassigned.lock().unwrap().push_back(record);
            }
        }
        self.promote_unassigned();
    }

    /// Submit a unit of work; the caller awaits the returned receiver rather
    /// than blocking the queue itself.
    #[instrument(skip(self, spec), fields(subsys = "WorkerTaskQueue", name = %spec.name))]
    pub fn add_task(&self, spec: WorkerTaskSpec, timeout: Duration) -> oneshot::Receiver<WorkerResult> {
        let (tx, rx) = oneshot::channel();
        let record = TaskRecord {
            id: WorkerTaskId::new(),
            name: spec.name,
            attrs: spec.attrs,
            payload: spec.payload,
            timeout,
            retry_counter: 0,
            assigned_worker: None,
            assigned_at: Instant::now(),
            result_tx: Some(tx),
        };
        self.dispatch(record, None);
        rx
    }

    fn dispatch(&self, mut record: TaskRecord, exclude: Option<&WorkerId>) {
        match self.select_worker(&record.name, &record.attrs, exclude) {
            Some(worker_id) => self.assign(worker_id, record),
            None => {
                record.assigned_worker = None;
                self.unassigned.lock().unwrap().push_back(record);
            }
        }
    }

    /// Least-loaded-worker selection, excluding `exclude` when retrying
    /// after a failure. If `exclude` leaves no match, retries are offered
    /// back to the same worker rather than stalling in `unassigned` forever
    /// — excluding it is a preference for an alternative, not a ban.
    fn select_worker(
        &self,
        name: &str,
        attrs: &BTreeMap<String, String>,
        exclude: Option<&WorkerId>,
    ) -> Option<WorkerId> {
        match self.best_match(name, attrs, exclude) {
            Some(worker_id) => Some(worker_id),
            None if exclude.is_some() => self.best_match(name, attrs, None),
            None => None,
        }
    }

    fn best_match(
        &self,
        name: &str,
        attrs: &BTreeMap<String, String>,
        exclude: Option<&WorkerId>,
    ) -> Option<WorkerId> {
        let mut best: Option<(WorkerId, usize, Instant)> = None;
        for entry in self.workers.iter() {
            let worker_id = entry.key();
            if Some(worker_id) == exclude {
                continue;
            }
            if !entry.descriptions.iter().any(|d| d.matches(name, attrs)) {
                continue;
            }
            let count = entry.outstanding_count.load(Ordering::SeqCst);
            let last_assigned = *entry.last_assigned_at.lock().unwrap();
            let better = match &best {
                None => true,
                Some((_, best_count, best_last)) => {
                    count < *best_count || (count == *best_count && last_assigned < *best_last)
                }
            };
            if better {
                best = Some((worker_id.clone(), count, last_assigned));
            }
        }
        best.map(|(id, _, _)| id)
    }

    fn assign(&self, worker_id: WorkerId, mut record: TaskRecord) {
        let Some(entry) = self.workers.get(&worker_id) else {
            // worker detached between selection and assignment; requeue
            record.assigned_worker = None;
            self.unassigned.lock().unwrap().push_back(record);
            return;
        };

        record.assigned_worker = Some(worker_id.clone());
        record.assigned_at = Instant::now();
        let envelope = record.envelope();

        if entry.inbound.try_send(envelope).is_err() {
            drop(entry);
            record.assigned_worker = None;
            self.unassigned.lock().unwrap().push_back(record);
            return;
        }

        entry.outstanding_count.fetch_add(1, Ordering::SeqCst);
        *entry.last_assigned_at.lock().unwrap() = record.assigned_at;
        drop(entry);
        self.outstanding.insert(record.id, record);
    }

    fn promote_unassigned(&self) {
        loop {
            let next = {
                let mut queue = self.unassigned.lock().unwrap();
                let Some(record) = queue.pop_front() else {
                    return;
                };
                record
            };
            match self.select_worker(&next.name, &next.attrs, None) {
                Some(worker_id) => self.assign(worker_id, next),
                None => {
                    self.unassigned.lock().unwrap().push_front(next);
                    return;
                }
            }
        }
    }

    fn release_worker_slot(&self, worker_id: &WorkerId) {
        if let Some(entry) = self.workers.get(worker_id) {
            entry.outstanding_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[instrument(skip(self, result), fields(subsys = "WorkerTaskQueue"))]
    pub fn acknowledge_task(
        &self,
        worker_id: &WorkerId,
        task_id: WorkerTaskId,
        result: Value,
    ) -> Result<(), WorkerQueueError> {
        let (_, mut record) = self
            .outstanding
            .remove(&task_id)
            .ok_or(WorkerQueueError::TaskNotFound(task_id))?;
        if record.assigned_worker.as_ref() != Some(worker_id) {
            let owner = record.assigned_worker.clone();
            self.outstanding.insert(task_id, record);
            return Err(WorkerQueueError::NotOwner(
                owner.unwrap_or_else(|| worker_id.clone()),
                task_id,
            ));
        }
        self.release_worker_slot(worker_id);
        if let Some(tx) = record.result_tx.take() {
            let _ = tx.send(Ok(result));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(subsys = "WorkerTaskQueue"))]
    pub fn error_task(
        &self,
        worker_id: &WorkerId,
        task_id: WorkerTaskId,
        reason: String,
    ) -> Result<(), WorkerQueueError> {
        let (_, record) = self
            .outstanding
            .remove(&task_id)
            .ok_or(WorkerQueueError::TaskNotFound(task_id))?;
        if record.assigned_worker.as_ref() != Some(worker_id) {
            let owner = record.assigned_worker.clone();
            self.outstanding.insert(task_id, record);
            return Err(WorkerQueueError::NotOwner(
                owner.unwrap_or_else(|| worker_id.clone()),
                task_id,
            ));
        }
        self.release_worker_slot(worker_id);
        self.fail_or_retry(record, reason, Some(worker_id.clone()));
        Ok(())
    }

    fn fail_or_retry(&self, mut record: TaskRecord, reason: String, exclude: Option<WorkerId>) {
        if record.retry_counter < MAX_RETRIES {
            record.retry_counter += 1;
            record.assigned_worker = None;
            self.dispatch(record, exclude.as_ref());
        } else if let Some(tx) = record.result_tx.take() {
            let _ = tx.send(Err(WorkerFailure(reason)));
        }
    }

    /// Periodic sweep: any task whose elapsed time since assignment exceeds
    /// its timeout is treated as an error with reason `"timeout"`.
    #[instrument(skip(self), fields(subsys = "WorkerTaskQueue"))]
    pub fn check_overdue(&self) {
        let now = Instant::now();
        let overdue: Vec<WorkerTaskId> = self
            .outstanding
            .iter()
            .filter(|entry| now.duration_since(entry.assigned_at) > entry.timeout)
            .map(|entry| entry.id)
            .collect();

        for id in overdue {
            if let Some((_, record)) = self.outstanding.remove(&id) {
                if let Some(worker_id) = &record.assigned_worker {
                    self.release_worker_slot(worker_id);
                }
                let exclude = record.assigned_worker.clone();
                self.fail_or_retry(record, "timeout".to_string(), exclude);
            }
        }
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn unassigned_len(&self) -> usize {
        self.unassigned.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn description(name: &str) -> WorkerTaskDescription {
        WorkerTaskDescription {
            name: name.to_string(),
            filter: BTreeMap::new(),
        }
    }

    fn spec(name: &str) -> WorkerTaskSpec {
        WorkerTaskSpec {
            name: name.to_string(),
            attrs: BTreeMap::new(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn task_is_delivered_and_acknowledged_exactly_once() {
        let queue = WorkerTaskQueue::new();
        let worker_id = WorkerId::new("worker_1").unwrap();
        let mut handle = queue.attach(worker_id.clone(), vec![description("validate_config")]);

        let result_rx = queue.add_task(spec("validate_config"), Duration::from_secs(5));
        let envelope = handle.recv().await.unwrap();

        queue
            .acknowledge_task(&worker_id, envelope.id, serde_json::json!({"ok": true}))
            .unwrap();

        let result = result_rx.await.unwrap();
        assert_eq!(result, Ok(serde_json::json!({"ok": true})));

        // a second ack for the same task is now a no-op failure, never a second completion
        let err = queue
            .acknowledge_task(&worker_id, envelope.id, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, WorkerQueueError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn unmatched_task_waits_in_unassigned_until_a_worker_attaches() {
        let queue = WorkerTaskQueue::new();
        let result_rx = queue.add_task(spec("validate_config"), Duration::from_secs(5));
        assert_eq!(queue.unassigned_len(), 1);

        let worker_id = WorkerId::new("worker_1").unwrap();
        let mut handle = queue.attach(worker_id.clone(), vec![description("validate_config")]);
        assert_eq!(queue.unassigned_len(), 0);

        let envelope = handle.recv().await.unwrap();
        queue
            .acknowledge_task(&worker_id, envelope.id, serde_json::Value::Null)
            .unwrap();
        result_rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn detach_returns_in_flight_tasks_to_unassigned_with_incremented_retry() {
        let queue = WorkerTaskQueue::new();
        let worker_id = WorkerId::new("worker_1").unwrap();
        let handle = queue.attach(worker_id.clone(), vec![description("validate_config")]);

        let _result_rx = queue.add_task(spec("validate_config"), Duration::from_secs(5));
        assert_eq!(queue.outstanding_len(), 1);

        drop(handle);
        assert_eq!(queue.outstanding_len(), 0);
        assert_eq!(queue.unassigned_len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_complete_the_future_as_a_failure() {
        let queue = WorkerTaskQueue::new();
        let worker_id = WorkerId::new("worker_1").unwrap();
        let mut handle = queue.attach(worker_id.clone(), vec![description("validate_config")]);

        let result_rx = queue.add_task(spec("validate_config"), Duration::from_secs(5));

        for _ in 0..=MAX_RETRIES {
            let envelope = handle.recv().await.unwrap();
            queue
                .error_task(&worker_id, envelope.id, "bad value".to_string())
                .unwrap();
        }

        let result = result_rx.await.unwrap();
        assert_eq!(result, Err(WorkerFailure("bad value".to_string())));
    }

    #[tokio::test]
    async fn check_overdue_times_out_stale_assignments() {
        let queue = WorkerTaskQueue::new();
        let worker_id = WorkerId::new("worker_1").unwrap();
        let mut handle = queue.attach(worker_id.clone(), vec![description("validate_config")]);

        let result_rx = queue.add_task(spec("validate_config"), Duration::from_millis(0));
        let _envelope = handle.recv().await.unwrap();

        // immediately overdue since timeout is zero
        for _ in 0..=MAX_RETRIES {
            queue.check_overdue();
            if let Ok(envelope) = handle.inbound.try_recv() {
                let _ = envelope;
            }
        }

        let result = result_rx.await.unwrap();
        assert_eq!(result, Err(WorkerFailure("timeout".to_string())));
    }

    #[tokio::test]
    async fn least_loaded_worker_is_preferred() {
        let queue = WorkerTaskQueue::new();
        let busy = WorkerId::new("busy").unwrap();
        let idle = WorkerId::new("idle").unwrap();
        let mut busy_handle = queue.attach(busy.clone(), vec![description("validate_config")]);
        let mut idle_handle = queue.attach(idle.clone(), vec![description("validate_config")]);

        let _rx1 = queue.add_task(spec("validate_config"), Duration::from_secs(5));
        let first = busy_handle.recv().await;
        // drain whichever worker got the first task so outstanding_count reflects load
        if first.is_none() {
            idle_handle.recv().await.unwrap();
        }

        let _rx2 = queue.add_task(spec("validate_config"), Duration::from_secs(5));
        // one of the two workers should now have two, the other (at least) one;
        // exact assignment depends on which got task 1, so just assert no panics
        // and that both tasks were delivered to *some* worker.
        assert_eq!(queue.outstanding_len(), 2);
    }
}
