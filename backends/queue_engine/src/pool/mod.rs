// Bounded worker pool shared by every processor on the host. Workers
// drive the executor and translate its classified failures into the
// task's fate: ack, warn-and-ack, retry in place, or redispatch.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use concurrent_queue::{ConcurrentQueue, PushError};

use crate::config::Dyn;
use crate::domains::DomainDirectory;
use crate::tasks::{
    ExecuteError, Executor, QueueTask, SubmitError, TaskAction, TaskProcessor, TransferKind,
};
use crate::wakeups::{Toggle, WakeSignal};

/// How long an idle worker sleeps before re-checking the queue.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Execution retries a worker burns through before giving the task
/// back to the redispatcher.
const IN_WORKER_RETRY_ROUNDS: u32 = 3;

const RETRY_PAUSE: Duration = Duration::from_millis(10);

enum TaskFate {
    Complete,
    CompleteWithWarning(&'static str),
    RetryNow,
    Redispatch,
}

struct PoolShared {
    queue: ConcurrentQueue<Arc<QueueTask>>,
    executor: Arc<dyn Executor>,
    directory: Arc<dyn DomainDirectory>,
    max_retry: Dyn<u32>,
    signal: WakeSignal,
    shutdown: Toggle,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

// --- constructors

impl WorkerPool {
    /// Spawns `worker_count` executor threads over a submit queue of
    /// `capacity` slots.
    #[must_use]
    pub fn start(
        worker_count: usize,
        capacity: usize,
        executor: Arc<dyn Executor>,
        directory: Arc<dyn DomainDirectory>,
        max_retry: Dyn<u32>,
    ) -> Arc<Self> {
        let shared = Arc::new(PoolShared {
            queue: ConcurrentQueue::bounded(capacity.max(1)),
            executor,
            directory,
            max_retry,
            signal: WakeSignal::new(),
            shutdown: Toggle::new(),
        });

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("taskloom-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("worker thread spawns")
            })
            .collect();

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }
}

// --- methods

impl WorkerPool {
    pub fn stop(&self) {
        if !self.shared.shutdown.turn_on() {
            return;
        }
        self.shared.queue.close();
        self.shared.signal.notify();

        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for worker in workers.drain(..) {
            self.shared.signal.notify();
            if worker.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl TaskProcessor for WorkerPool {
    fn try_submit(&self, task: Arc<QueueTask>) -> Result<bool, SubmitError> {
        if self.shared.shutdown.probe() {
            return Err(SubmitError::Closed);
        }
        match self.shared.queue.push(task) {
            Ok(()) => {
                self.shared.signal.notify();
                Ok(true)
            }
            Err(PushError::Full(_)) => Ok(false),
            Err(PushError::Closed(_)) => Err(SubmitError::Closed),
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        if shared.shutdown.probe() {
            break;
        }
        match shared.queue.pop() {
            Ok(task) => run_task(shared, &task),
            Err(_) => {
                if shared.shutdown.probe() {
                    break;
                }
                shared
                    .signal
                    .wait_until(Some(Instant::now() + WORKER_IDLE_WAIT));
            }
        }
    }
    // drain what was already admitted so nothing sits half-owned
    while let Ok(task) = shared.queue.pop() {
        task.nack();
    }
}

fn run_task(shared: &PoolShared, task: &Arc<QueueTask>) {
    let Some(should_process) = task.should_process() else {
        // no allocator verdict yet; the owning processor re-filters
        // before the next ack sweep
        task.nack();
        return;
    };

    for round in 0..IN_WORKER_RETRY_ROUNDS {
        let outcome = shared.executor.execute(task.info(), should_process);
        match decide_fate(shared, task, outcome) {
            TaskFate::Complete => {
                task.ack();
                return;
            }
            TaskFate::CompleteWithWarning(reason) => {
                tracing::warn!(
                    key = %task.key(),
                    domain_id = task.domain_id(),
                    reason,
                    "completing task despite executor failure"
                );
                task.ack();
                return;
            }
            TaskFate::Redispatch => {
                task.record_attempt();
                task.nack();
                return;
            }
            TaskFate::RetryNow => {
                let attempt = task.record_attempt();
                if attempt >= shared.max_retry.get() {
                    // never dropped: it keeps cycling through the
                    // redispatcher at warn level
                    tracing::warn!(
                        key = %task.key(),
                        domain_id = task.domain_id(),
                        attempt,
                        "task exceeded retry budget, still retrying"
                    );
                }
                thread::sleep(RETRY_PAUSE * (round + 1));
            }
        }
    }
    task.nack();
}

fn decide_fate(
    shared: &PoolShared,
    task: &Arc<QueueTask>,
    outcome: Result<(), ExecuteError>,
) -> TaskFate {
    match outcome {
        Ok(()) => TaskFate::Complete,
        Err(ExecuteError::EntityNotExists) => {
            tracing::debug!(key = %task.key(), "entity gone, duplicate task completed");
            TaskFate::Complete
        }
        Err(ExecuteError::Discarded) => TaskFate::Complete,
        Err(ExecuteError::Redispatch | ExecuteError::PendingActive) => TaskFate::Redispatch,
        Err(ExecuteError::DomainNotActive) => {
            // ownership may simply not have propagated yet; only old
            // tasks are safe to complete
            let horizon = shared.directory.refresh_interval() * 2;
            let age = task
                .age(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > horizon {
                TaskFate::Complete
            } else {
                TaskFate::RetryNow
            }
        }
        Err(ExecuteError::ConditionFailed) => {
            TaskFate::CompleteWithWarning("mutable state condition failed")
        }
        Err(ExecuteError::CorruptedHistory) => {
            if matches!(
                task.info().action,
                TaskAction::Transfer(TransferKind::CloseExecution)
            ) {
                TaskFate::CompleteWithWarning("corrupted history on close execution")
            } else {
                TaskFate::RetryNow
            }
        }
        Err(ExecuteError::Other(reason)) => {
            tracing::debug!(key = %task.key(), reason, "task execution failed, retrying");
            TaskFate::RetryNow
        }
    }
}
