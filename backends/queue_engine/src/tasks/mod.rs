// Task data model: the tagged task-info variant read from storage,
// the in-memory task lifecycle the engine tracks, and the executor
// capability that drives the workflow state machine per task type.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{QueueKind, TaskKey};

/// Transfer-stream task types. The engine never interprets these
/// beyond routing; the [`Executor`] owns their semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    PushActivity,
    PushDecision,
    CloseExecution,
    CancelExecution,
    SignalExecution,
    StartChildExecution,
    RecordWorkflowStarted,
    ResetWorkflow,
}

/// Timer-stream task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    DecisionTimeout,
    ActivityTimeout,
    UserTimer,
    WorkflowBackoffTimer,
    WorkflowTimeout,
    DeleteHistoryEvent,
}

/// Discriminated task action; the variant selects the per-type code
/// path inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    Transfer(TransferKind),
    Timer(TimerKind),
}

/// One raw task row as read from the durable stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub key: TaskKey,
    pub action: TaskAction,
    pub created: DateTime<Utc>,
}

impl TaskInfo {
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.key.kind()
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created
    }
}

/// Terminality of a tracked task. Only `Acked` lets the ack level
/// move past the task's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Acked,
    Nacked,
}

const STATE_PENDING: u8 = 0;
const STATE_ACKED: u8 = 1;
const STATE_NACKED: u8 = 2;

/// Where a nacked task goes to stay alive between re-reads. The
/// redispatcher implements this; tasks hold a weak handle so a
/// stopped processor drops its backlog cleanly.
pub trait NackSink: Send + Sync {
    fn redispatch(&self, task: Arc<QueueTask>);
}

/// [`QueueTask`] is one outstanding task tracked by a processing
/// queue. It owns no threads; the host processor and the worker pool
/// drive it. State transitions are atomic so the poller's ack sweep
/// can observe progress without locking the executing worker.
pub struct QueueTask {
    info: TaskInfo,
    queue_type: QueueKind,
    state: AtomicU8,
    attempt: AtomicU32,
    priority: AtomicU32,
    submit_time: DateTime<Utc>,
    should_process: Mutex<Option<bool>>,
    nack_sink: Mutex<Option<Weak<dyn NackSink>>>,
}

// --- constructors

impl QueueTask {
    #[must_use]
    pub fn new(info: TaskInfo, submit_time: DateTime<Utc>) -> Self {
        let queue_type = info.kind();
        Self {
            info,
            queue_type,
            state: AtomicU8::new(STATE_PENDING),
            attempt: AtomicU32::new(0),
            priority: AtomicU32::new(0),
            submit_time,
            should_process: Mutex::new(None),
            nack_sink: Mutex::new(None),
        }
    }
}

// --- methods

impl QueueTask {
    #[must_use]
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    #[must_use]
    pub fn key(&self) -> TaskKey {
        self.info.key
    }

    #[must_use]
    pub fn domain_id(&self) -> &str {
        &self.info.domain_id
    }

    #[must_use]
    pub fn queue_type(&self) -> QueueKind {
        self.queue_type
    }

    #[must_use]
    pub fn submit_time(&self) -> DateTime<Utc> {
        self.submit_time
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACKED => TaskState::Acked,
            STATE_NACKED => TaskState::Nacked,
            _ => TaskState::Pending,
        }
    }

    pub fn ack(&self) {
        self.state.store(STATE_ACKED, Ordering::Release);
    }

    /// Marks the task for redispatch and hands it to the attached
    /// sink. The task stays outstanding in its queue until acked.
    pub fn nack(self: &Arc<Self>) {
        self.state.store(STATE_NACKED, Ordering::Release);
        let sink = self
            .nack_sink
            .lock()
            .expect("nack sink lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.redispatch(self.clone());
        }
    }

    /// Returns the task to pending right before a re-offer.
    pub fn mark_pending(&self) {
        self.state.store(STATE_PENDING, Ordering::Release);
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Counts one failed execution; returns the new attempt count.
    pub fn record_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    /// The allocator's verdict for this task, if a verdict was
    /// reachable. `None` means the ownership lookup failed and must be
    /// retried before the task can be submitted.
    #[must_use]
    pub fn should_process(&self) -> Option<bool> {
        *self
            .should_process
            .lock()
            .expect("should_process lock poisoned")
    }

    pub fn set_should_process(&self, verdict: Option<bool>) {
        *self
            .should_process
            .lock()
            .expect("should_process lock poisoned") = verdict;
    }

    pub fn attach_nack_sink(&self, sink: &Arc<dyn NackSink>) {
        *self.nack_sink.lock().expect("nack sink lock poisoned") = Some(Arc::downgrade(sink));
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.info.age(now)
    }
}

impl core::fmt::Debug for QueueTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueTask")
            .field("key", &self.info.key)
            .field("domain_id", &self.info.domain_id)
            .field("state", &self.state())
            .field("attempt", &self.attempt())
            .finish_non_exhaustive()
    }
}

/// Classified failures an [`Executor`] may report. The worker pool
/// maps each variant onto the task's fate; see `pool`.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The referenced entity is gone; the task is an idempotent
    /// duplicate and counts as done.
    #[error("entity referenced by task no longer exists")]
    EntityNotExists,

    /// The task must be handed back and retried later.
    #[error("task asked to be redispatched")]
    Redispatch,

    /// The domain is mid-failover; retry once ownership settles.
    #[error("domain is pending active")]
    PendingActive,

    /// A standby task stalled past its discard horizon and was
    /// intentionally dropped.
    #[error("task discarded after standby stall")]
    Discarded,

    /// The domain is not active in this cluster.
    #[error("domain not active in this cluster")]
    DomainNotActive,

    /// Mutable-state condition check failed while applying the task.
    #[error("condition failed applying task")]
    ConditionFailed,

    /// Close-execution met corrupted workflow history.
    #[error("workflow history corrupted")]
    CorruptedHistory,

    #[error("task execution failed: {0}")]
    Other(String),
}

/// The per-task-type executor. External collaborator: the engine only
/// routes tasks here and classifies what comes back.
pub trait Executor: Send + Sync {
    /// Drives the workflow state machine for one task.
    /// `should_process = false` still flows through so executors can
    /// record progress for tasks this cluster must merely track.
    fn execute(&self, info: &TaskInfo, should_process: bool) -> Result<(), ExecuteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("task processor is shut down")]
    Closed,
}

/// Shared bounded task processor. `try_submit` never blocks: `false`
/// means the host is saturated and the caller should redispatch.
pub trait TaskProcessor: Send + Sync {
    fn try_submit(&self, task: Arc<QueueTask>) -> Result<bool, SubmitError>;
}

#[cfg(test)]
mod test_queue_tasks {
    use chrono::Utc;

    use super::*;
    use crate::keys::TaskKey;

    pub(crate) fn transfer_info(task_id: i64, domain: &str) -> TaskInfo {
        TaskInfo {
            domain_id: domain.to_string(),
            workflow_id: format!("wf-{task_id}"),
            run_id: format!("run-{task_id}"),
            key: TaskKey::transfer(task_id),
            action: TaskAction::Transfer(TransferKind::PushActivity),
            created: Utc::now(),
        }
    }

    #[test]
    fn new_task_starts_pending_without_verdict() {
        let task = QueueTask::new(transfer_info(1, "d1"), Utc::now());
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempt(), 0);
        assert_eq!(task.should_process(), None);
    }

    #[test]
    fn nack_marks_without_counting() {
        let task = Arc::new(QueueTask::new(transfer_info(1, "d1"), Utc::now()));
        task.nack();
        assert_eq!(task.state(), TaskState::Nacked);
        assert_eq!(task.attempt(), 0);
    }

    #[test]
    fn attempts_accumulate() {
        let task = QueueTask::new(transfer_info(1, "d1"), Utc::now());
        assert_eq!(task.record_attempt(), 1);
        assert_eq!(task.record_attempt(), 2);
        assert_eq!(task.attempt(), 2);
    }

    #[test]
    fn ack_is_terminal_for_the_sweep() {
        let task = QueueTask::new(transfer_info(1, "d1"), Utc::now());
        task.ack();
        assert_eq!(task.state(), TaskState::Acked);
    }
}
