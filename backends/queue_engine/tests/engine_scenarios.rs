// End-to-end scenarios for the shard queue engine: poll/read-level
// behavior against a scripted storage, failover sweeps, and full
// drain pipelines over the in-memory shard.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serial_test::serial;
use tracing_test::traced_test;

use taskloom_queues::allocator::{AllocatorError, TaskAllocator};
use taskloom_queues::config::{Dyn, QueueConfig};
use taskloom_queues::domains::{DomainOwnership, StaticDomainDirectory};
use taskloom_queues::engine::{
    spawn_processor, ActionOutcome, ActiveCohort, GateKind, ProcessorCohort, ProcessorSpec,
    QueueAction, QueueProcessor,
};
use taskloom_queues::keys::{QueueKind, TaskKey};
use taskloom_queues::pool::WorkerPool;
use taskloom_queues::queues::QueueState;
use taskloom_queues::storage::{
    MemoryShardStorage, PageToken, PersistedQueueState, ShardStorage, StorageError, TaskPage,
};
use taskloom_queues::tasks::{ExecuteError, Executor, TaskAction, TaskInfo, TransferKind};

// --- shared fixtures

fn fast_config() -> QueueConfig {
    let config = QueueConfig::default();
    config.batch_size.set(4);
    config.max_poll_rps.set(10_000);
    config.max_poll_interval.set(Duration::from_millis(200));
    config.update_ack_interval.set(Duration::from_millis(50));
    config.redispatch_interval.set(Duration::from_millis(50));
    config.poll_backoff_interval.set(Duration::from_millis(100));
    config.complete_interval.set(Duration::from_millis(100));
    config
}

fn directory() -> Arc<StaticDomainDirectory> {
    let directory = StaticDomainDirectory::new(Duration::from_secs(10));
    directory.register(
        "d-local",
        DomainOwnership {
            active_cluster: "local".to_string(),
            failover_version: 1,
            is_global: true,
            pending_active: false,
        },
    );
    directory.register(
        "d-remote",
        DomainOwnership {
            active_cluster: "remote".to_string(),
            failover_version: 1,
            is_global: true,
            pending_active: false,
        },
    );
    Arc::new(directory)
}

fn transfer_info(task_id: i64, domain: &str) -> TaskInfo {
    TaskInfo {
        domain_id: domain.to_string(),
        workflow_id: format!("wf-{task_id}"),
        run_id: format!("run-{task_id}"),
        key: TaskKey::transfer(task_id),
        action: TaskAction::Transfer(TransferKind::PushActivity),
        created: Utc::now(),
    }
}

fn timer_info(task_id: i64, due: chrono::DateTime<Utc>, domain: &str) -> TaskInfo {
    TaskInfo {
        domain_id: domain.to_string(),
        workflow_id: format!("wf-{task_id}"),
        run_id: format!("run-{task_id}"),
        key: TaskKey::timer(due, task_id),
        action: TaskAction::Timer(taskloom_queues::tasks::TimerKind::UserTimer),
        created: Utc::now(),
    }
}

#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<(TaskKey, bool)>>,
}

impl Executor for RecordingExecutor {
    fn execute(&self, info: &TaskInfo, should_process: bool) -> Result<(), ExecuteError> {
        self.executed
            .lock()
            .expect("lock poisoned")
            .push((info.key, should_process));
        Ok(())
    }
}

fn worker_pool(executor: Arc<RecordingExecutor>) -> Arc<WorkerPool> {
    WorkerPool::start(2, 64, executor, directory(), Dyn::new(10))
}

fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

// --- scripted storage for the read-level scenarios

/// Storage that serves a fixed list of pages and then goes
/// unavailable, recording every read request it sees.
struct ScriptedReads {
    inner: MemoryShardStorage,
    pages: Mutex<Vec<TaskPage>>,
    reads: AtomicUsize,
}

impl ScriptedReads {
    fn new(pages: Vec<TaskPage>) -> Self {
        Self {
            inner: MemoryShardStorage::new(),
            pages: Mutex::new(pages),
            reads: AtomicUsize::new(0),
        }
    }

    fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl ShardStorage for ScriptedReads {
    fn get_tasks(
        &self,
        _kind: QueueKind,
        _read_level: TaskKey,
        _max_read_level: TaskKey,
        _batch_size: usize,
        _page: Option<PageToken>,
    ) -> Result<TaskPage, StorageError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        let mut pages = self.pages.lock().expect("lock poisoned");
        if pages.is_empty() {
            return Err(StorageError::Unavailable("script exhausted".to_string()));
        }
        Ok(pages.remove(0))
    }

    fn range_complete(
        &self,
        kind: QueueKind,
        begin: TaskKey,
        end: TaskKey,
    ) -> Result<usize, StorageError> {
        self.inner.range_complete(kind, begin, end)
    }

    fn cluster_ack_level(&self, kind: QueueKind, cluster: &str) -> Result<TaskKey, StorageError> {
        self.inner.cluster_ack_level(kind, cluster)
    }

    fn set_cluster_ack_level(
        &self,
        kind: QueueKind,
        cluster: &str,
        ack_level: TaskKey,
    ) -> Result<(), StorageError> {
        self.inner.set_cluster_ack_level(kind, cluster, ack_level)
    }

    fn all_cluster_ack_levels(
        &self,
        kind: QueueKind,
    ) -> Result<HashMap<String, TaskKey>, StorageError> {
        self.inner.all_cluster_ack_levels(kind)
    }

    fn queue_states(
        &self,
        kind: QueueKind,
        cluster: &str,
    ) -> Result<Option<Vec<PersistedQueueState>>, StorageError> {
        self.inner.queue_states(kind, cluster)
    }

    fn set_queue_states(
        &self,
        kind: QueueKind,
        cluster: &str,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        self.inner.set_queue_states(kind, cluster, states)
    }

    fn completed_level(&self, kind: QueueKind) -> Result<TaskKey, StorageError> {
        self.inner.completed_level(kind)
    }

    fn set_completed_level(&self, kind: QueueKind, level: TaskKey) -> Result<(), StorageError> {
        self.inner.set_completed_level(kind, level)
    }

    fn failover_levels(
        &self,
        kind: QueueKind,
    ) -> Result<HashMap<String, taskloom_queues::storage::FailoverLevel>, StorageError> {
        self.inner.failover_levels(kind)
    }

    fn set_failover_level(
        &self,
        kind: QueueKind,
        failover_id: &str,
        level: taskloom_queues::storage::FailoverLevel,
    ) -> Result<(), StorageError> {
        self.inner.set_failover_level(kind, failover_id, level)
    }

    fn delete_failover_level(
        &self,
        kind: QueueKind,
        failover_id: &str,
    ) -> Result<(), StorageError> {
        self.inner.delete_failover_level(kind, failover_id)
    }

    fn max_read_level(&self, kind: QueueKind) -> TaskKey {
        self.inner.max_read_level(kind)
    }
}

/// Cohort pinning the queue range to `(0, 1000]` and the shard read
/// horizon to a fixed key, as the read-level scenarios require.
struct BoundedCohort {
    shard_max: TaskKey,
    delegate: ActiveCohort,
}

impl BoundedCohort {
    fn new(shard_max: i64, storage: Arc<dyn ShardStorage>) -> Self {
        let allocator = Arc::new(TaskAllocator::new("local", directory()));
        Self {
            shard_max: TaskKey::transfer(shard_max),
            delegate: ActiveCohort::new(QueueKind::Transfer, "local", storage, allocator),
        }
    }
}

impl ProcessorCohort for BoundedCohort {
    fn label(&self) -> String {
        "bounded-test".to_string()
    }

    fn max_read_level(&self) -> TaskKey {
        self.shard_max
    }

    fn persist_ack_level(&self, ack_level: TaskKey) -> Result<(), StorageError> {
        self.delegate.persist_ack_level(ack_level)
    }

    fn persist_queue_states(
        &self,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        self.delegate.persist_queue_states(states)
    }

    fn initial_states(&self, _load_persisted: bool) -> Result<Vec<QueueState>, StorageError> {
        let bounded = QueueState::new(
            0,
            TaskKey::transfer(0),
            TaskKey::transfer(0),
            TaskKey::transfer(1000),
            taskloom_queues::domains::DomainFilter::all(),
        )
        .map_err(|err| StorageError::Corrupted(err.to_string()))?;
        let tail = QueueState::new(
            0,
            TaskKey::transfer(1000),
            TaskKey::transfer(1000),
            TaskKey::max_sentinel(QueueKind::Transfer),
            taskloom_queues::domains::DomainFilter::all(),
        )
        .map_err(|err| StorageError::Corrupted(err.to_string()))?;
        Ok(vec![bounded, tail])
    }

    fn task_filter(&self, _info: &TaskInfo) -> Result<bool, AllocatorError> {
        Ok(true)
    }

    fn queue_shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn page(ids: &[i64], more: bool) -> TaskPage {
    TaskPage {
        tasks: ids.iter().map(|id| transfer_info(*id, "d-local")).collect(),
        next_page: more.then(|| b"more".to_vec()),
    }
}

fn spawn_bounded(
    storage: Arc<ScriptedReads>,
    shard_max: i64,
) -> Arc<taskloom_queues::engine::ProcessorHandle> {
    let executor = Arc::new(RecordingExecutor::default());
    let spec = ProcessorSpec {
        kind: QueueKind::Transfer,
        cohort: Arc::new(BoundedCohort::new(shard_max, storage.clone())),
        storage,
        task_processor: worker_pool(executor),
        config: fast_config(),
        gate_kind: GateKind::Open,
    };
    spawn_processor(spec).expect("processor spawns")
}

fn first_queue_read_level(handle: &taskloom_queues::engine::ProcessorHandle) -> TaskKey {
    match handle
        .handle_action(QueueAction::GetState, Duration::from_secs(5))
        .expect("state answered")
    {
        ActionOutcome::State(states) => states
            .iter()
            .min_by_key(|state| state.ack_level())
            .expect("at least one queue")
            .read_level(),
        ActionOutcome::ResetDone => unreachable!("GetState never answers ResetDone"),
    }
}

// --- S1..S3: read-level scenarios

#[test]
#[traced_test]
#[serial]
#[ntest::timeout(30000)]
fn full_page_with_continuation_rereads_immediately() {
    // queue (0,1000], shard max 10000; first page {1,10,100,500} with
    // a continuation: read level moves to the last key and the next
    // read follows without waiting for a poll interval
    let storage = Arc::new(ScriptedReads::new(vec![page(&[1, 10, 100, 500], true)]));
    let handle = spawn_bounded(storage.clone(), 10_000);

    wait_for("second immediate read", || storage.read_count() >= 2);
    assert_eq!(first_queue_read_level(&handle), TaskKey::transfer(500));

    handle.stop();
}

#[test]
#[serial]
#[ntest::timeout(30000)]
fn short_page_in_range_reads_to_queue_max() {
    // queue (0,1000], shard max 10000; one short page without
    // continuation: the whole requested range counts as read
    let storage = Arc::new(ScriptedReads::new(vec![page(&[1, 10, 100], false)]));
    let handle = spawn_bounded(storage.clone(), 10_000);

    wait_for("read level at queue max", || {
        first_queue_read_level(&handle) == TaskKey::transfer(1000)
    });

    handle.stop();
}

#[test]
#[serial]
#[ntest::timeout(30000)]
fn shard_horizon_caps_the_read_level() {
    // queue (0,1000] but the shard has only handed out keys up to
    // 500: the read stops at the horizon and waits for notification
    let storage = Arc::new(ScriptedReads::new(vec![page(&[1, 10, 100], false)]));
    let handle = spawn_bounded(storage.clone(), 500);

    wait_for("read level at shard horizon", || {
        first_queue_read_level(&handle) == TaskKey::transfer(500)
    });

    // no continuation and the queue range is not exhausted: the next
    // read only comes on the (long) poll interval, not immediately
    let reads_after_first = storage.read_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(storage.read_count(), reads_after_first);

    handle.stop();
}

// --- queue-state round trip

#[test]
fn queue_states_round_trip_through_storage() {
    let storage = MemoryShardStorage::new();
    let states = vec![
        PersistedQueueState {
            level: 0,
            ack_level: TaskKey::transfer(10),
            read_level: TaskKey::transfer(90),
            max_level: TaskKey::transfer(500),
            domain_ids: vec!["d1".to_string()],
            reverse_match: false,
        },
        PersistedQueueState {
            level: 1,
            ack_level: TaskKey::transfer(400),
            read_level: TaskKey::transfer(420),
            max_level: TaskKey::transfer(i64::MAX),
            domain_ids: Vec::new(),
            reverse_match: true,
        },
    ];
    storage
        .set_queue_states(QueueKind::Transfer, "local", states.clone())
        .expect("states persist");

    let reloaded = storage
        .queue_states(QueueKind::Transfer, "local")
        .expect("states read")
        .expect("states present");
    assert_eq!(reloaded, states);

    for record in &reloaded {
        let state = QueueState::from_persisted(record).expect("state valid");
        assert_eq!(state.level(), record.level);
        assert_eq!(state.ack_level(), record.ack_level);
        assert_eq!(state.max_level(), record.max_level);
        // reloaded queues restart reading from their ack level
        assert_eq!(state.read_level(), state.ack_level());
    }
}

// --- full drain through the outer processor

#[test]
#[ntest::timeout(30000)]
fn transfer_tasks_drain_and_complete_end_to_end() {
    let storage = Arc::new(MemoryShardStorage::new());
    for id in 1..=20 {
        storage.add_task(transfer_info(id, "d-local"));
    }

    let executor = Arc::new(RecordingExecutor::default());
    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        worker_pool(executor.clone()),
        fast_config(),
    );
    processor.start().expect("processor starts");
    processor
        .notify_new_task("local", &[transfer_info(20, "d-local")])
        .expect("notify accepted");

    wait_for("all tasks executed", || {
        executor.executed.lock().expect("lock").len() >= 20
    });
    wait_for("acked range deleted from storage", || {
        storage.remaining_tasks(QueueKind::Transfer) == 0
    });
    wait_for("completion watermark advanced", || {
        storage
            .completed_level(QueueKind::Transfer)
            .expect("completed level readable")
            >= TaskKey::transfer(20)
    });

    processor.stop();

    // every execution carried the active verdict
    assert!(executor
        .executed
        .lock()
        .expect("lock")
        .iter()
        .all(|(_, should)| *should));
}

#[test]
#[ntest::timeout(30000)]
fn standby_tracks_remote_tasks_without_active_verdict() {
    let storage = Arc::new(MemoryShardStorage::new());
    storage.add_task(transfer_info(1, "d-remote"));

    let executor = Arc::new(RecordingExecutor::default());
    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string(), "remote".to_string()],
        storage.clone(),
        allocator,
        worker_pool(executor.clone()),
        fast_config(),
    );
    processor.start().expect("processor starts");

    // the active processor sees the remote-owned task with a false
    // verdict; the standby processor sees it with a true one
    wait_for("both processors executed the task", || {
        executor.executed.lock().expect("lock").len() >= 2
    });
    let verdicts: BTreeSet<bool> = executor
        .executed
        .lock()
        .expect("lock")
        .iter()
        .map(|(_, should)| *should)
        .collect();
    assert_eq!(verdicts, BTreeSet::from([false, true]));

    processor.stop();
}

#[test]
#[ntest::timeout(30000)]
fn timer_tasks_fire_when_due() {
    let storage = Arc::new(MemoryShardStorage::new());
    let due_soon = Utc::now() + chrono::Duration::milliseconds(150);
    storage.add_task(timer_info(1, Utc::now() - chrono::Duration::seconds(1), "d-local"));
    storage.add_task(timer_info(2, due_soon, "d-local"));

    let executor = Arc::new(RecordingExecutor::default());
    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    let processor = QueueProcessor::new(
        QueueKind::Timer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        worker_pool(executor.clone()),
        fast_config(),
    );
    processor.start().expect("processor starts");
    processor
        .notify_new_task("local", &[timer_info(2, due_soon, "d-local")])
        .expect("notify accepted");

    wait_for("both timers fired", || {
        executor.executed.lock().expect("lock").len() >= 2
    });

    processor.stop();
}

// --- S6: failover kick

#[test]
#[traced_test]
#[serial]
#[ntest::timeout(30000)]
fn failover_sweep_covers_the_historical_range() {
    let storage = Arc::new(MemoryShardStorage::new());
    storage
        .set_cluster_ack_level(QueueKind::Transfer, "local", TaskKey::transfer(300))
        .expect("ack persists");
    storage
        .set_cluster_ack_level(QueueKind::Transfer, "remote", TaskKey::transfer(200))
        .expect("ack persists");
    // one unread task keeps the sweep busy; 340 lies inside (200,351]
    storage.add_task(transfer_info(340, "d-remote"));
    storage.set_max_read_level(QueueKind::Transfer, TaskKey::transfer(350));

    let executor = Arc::new(RecordingExecutor::default());
    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    // a slow completion cadence keeps the historical range intact
    // until the failover record pins it
    let config = fast_config();
    config.complete_interval.set(Duration::from_secs(2));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        worker_pool(executor.clone()),
        config,
    );
    processor.start().expect("processor starts");

    wait_for("active read level reaches the horizon", || {
        match processor.handle_action("local", QueueAction::GetState) {
            Ok(ActionOutcome::State(states)) => states
                .iter()
                .any(|state| state.read_level() >= TaskKey::transfer(350)),
            _ => false,
        }
    });

    let domains: BTreeSet<String> = ["d-remote".to_string()].into();
    let failover_id = processor
        .failover_domains(domains.clone())
        .expect("failover minted")
        .expect("processor was started");

    let records = storage
        .failover_levels(QueueKind::Transfer)
        .expect("records readable");
    let record = records.get(&failover_id).expect("record persisted");
    assert_eq!(record.min_level, TaskKey::transfer(200));
    assert_eq!(record.max_level, TaskKey::transfer(351));
    assert_eq!(record.domain_ids, domains);
    assert!(record.ack_level >= TaskKey::transfer(200));

    // the sweep executes the historical task, drains, and deletes its
    // own record
    wait_for("failover record retired", || {
        storage
            .failover_levels(QueueKind::Transfer)
            .expect("records readable")
            .is_empty()
    });
    assert!(executor
        .executed
        .lock()
        .expect("lock")
        .iter()
        .any(|(key, should)| *key == TaskKey::transfer(340) && *should));

    processor.stop();
}

// --- filter failures hold tasks without losing them

#[test]
#[ntest::timeout(30000)]
fn unknown_domain_tasks_wait_for_the_directory_to_heal() {
    let storage = Arc::new(MemoryShardStorage::new());
    storage.add_task(transfer_info(1, "d-late"));

    let executor = Arc::new(RecordingExecutor::default());
    let late_directory = directory();
    let allocator = Arc::new(TaskAllocator::new("local", late_directory.clone()));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        WorkerPool::start(2, 64, executor.clone(), late_directory.clone(), Dyn::new(10)),
        fast_config(),
    );
    processor.start().expect("processor starts");

    // the ownership lookup fails, so the task is tracked but not
    // executed; it must not be lost
    std::thread::sleep(Duration::from_millis(200));
    assert!(executor.executed.lock().expect("lock").is_empty());
    match processor
        .handle_action("local", QueueAction::GetState)
        .expect("state answered")
    {
        ActionOutcome::State(states) => {
            assert!(states
                .iter()
                .any(|state| state.read_level() >= TaskKey::transfer(1)));
        }
        ActionOutcome::ResetDone => unreachable!("GetState never answers ResetDone"),
    }

    // once the domain registers, the next ack sweep re-filters and
    // submits the held task
    late_directory.register(
        "d-late",
        DomainOwnership {
            active_cluster: "local".to_string(),
            failover_version: 1,
            is_global: false,
            pending_active: false,
        },
    );
    wait_for("held task executed after directory heals", || {
        !executor.executed.lock().expect("lock").is_empty()
    });

    processor.stop();
}

// --- queue splitting under a hot domain

#[test]
#[ntest::timeout(30000)]
fn hot_domain_is_split_to_a_higher_level() {
    let storage = Arc::new(MemoryShardStorage::new());
    for id in 1..=10 {
        storage.add_task(transfer_info(id, "d-local"));
    }

    // tasks never complete, so the backlog crosses the split
    // threshold and stays there
    struct StuckExecutor;
    impl Executor for StuckExecutor {
        fn execute(&self, _info: &TaskInfo, _should: bool) -> Result<(), ExecuteError> {
            Err(ExecuteError::Redispatch)
        }
    }

    let config = fast_config();
    config.enable_split.set(true);
    config.split_queue_interval.set(Duration::from_millis(100));
    config
        .pending_task_split_threshold
        .set(taskloom_queues::config::LevelThresholds::flat(5));

    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        WorkerPool::start(2, 64, Arc::new(StuckExecutor), directory(), Dyn::new(10)),
        config,
    );
    processor.start().expect("processor starts");

    wait_for("hot domain carved out to level 1", || {
        match processor.handle_action("local", QueueAction::GetState) {
            Ok(ActionOutcome::State(states)) => states.iter().any(|state| {
                state.level() == 1 && state.domain_filter().matches("d-local")
            }),
            _ => false,
        }
    });

    processor.stop();
}

// --- reset action

#[test]
fn reset_collapses_to_a_single_level_zero_queue() {
    let storage = Arc::new(MemoryShardStorage::new());
    storage
        .set_cluster_ack_level(QueueKind::Transfer, "local", TaskKey::transfer(50))
        .expect("ack persists");

    let executor = Arc::new(RecordingExecutor::default());
    let allocator = Arc::new(TaskAllocator::new("local", directory()));
    let processor = QueueProcessor::new(
        QueueKind::Transfer,
        "local",
        vec!["local".to_string()],
        storage.clone(),
        allocator,
        worker_pool(executor),
        fast_config(),
    );
    processor.start().expect("processor starts");

    match processor
        .handle_action("local", QueueAction::Reset)
        .expect("reset accepted")
    {
        ActionOutcome::ResetDone => {}
        ActionOutcome::State(_) => panic!("reset answers ResetDone"),
    }

    match processor
        .handle_action("local", QueueAction::GetState)
        .expect("state answered")
    {
        ActionOutcome::State(states) => {
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].level(), 0);
            assert_eq!(states[0].ack_level(), TaskKey::transfer(50));
            assert_eq!(
                states[0].max_level(),
                TaskKey::max_sentinel(QueueKind::Transfer)
            );
        }
        ActionOutcome::ResetDone => panic!("GetState answers states"),
    }

    processor.stop();

    // a stopped processor answers with the shutdown sentinel
    assert!(matches!(
        processor.handle_action("local", QueueAction::GetState),
        Err(taskloom_queues::engine::EngineError::Shutdown)
    ));
}
