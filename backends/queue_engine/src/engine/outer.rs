// The outer queue processor: one per shard per stream kind. Owns the
// active processor, one standby processor per remote cluster, any
// in-flight failover sweeps, and the completion loop that range-
// deletes acked prefixes from storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::allocator::TaskAllocator;
use crate::config::{jittered, QueueConfig};
use crate::keys::{QueueKind, TaskKey};
use crate::storage::{ShardStorage, StorageError};
use crate::tasks::{TaskInfo, TaskProcessor};
use crate::wakeups::{Toggle, WakeSignal};

use super::actions::{ActionOutcome, QueueAction};
use super::base::{spawn_processor, GateKind, ProcessorHandle, ProcessorSpec};
use super::cohort::{ActiveCohort, FailoverCohort, ProcessorCohort, StandbyCohort};
use super::EngineError;

const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on waiting for the completion loop during stop.
const STOP_COMPLETION_WAIT: Duration = Duration::from_secs(60);

const COMPLETE_RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initialized,
    Started,
    Stopped,
}

pub struct QueueProcessor {
    kind: QueueKind,
    current_cluster: String,
    clusters: Vec<String>,
    storage: Arc<dyn ShardStorage>,
    allocator: Arc<TaskAllocator>,
    task_processor: Arc<dyn TaskProcessor>,
    config: QueueConfig,

    status: Mutex<Status>,
    active: Mutex<Option<Arc<ProcessorHandle>>>,
    standby: Mutex<HashMap<String, Arc<ProcessorHandle>>>,
    failover: Mutex<HashMap<String, Arc<ProcessorHandle>>>,

    completer_shutdown: Arc<Toggle>,
    completer_signal: Arc<WakeSignal>,
    completer_done: Arc<Toggle>,
    completer_done_signal: Arc<WakeSignal>,
    completer_join: Mutex<Option<thread::JoinHandle<()>>>,
}

// --- constructors

impl QueueProcessor {
    /// Builds the outer processor. `clusters` lists every cluster
    /// whose progress this shard tracks; standby processors spawn for
    /// each remote entry, so a host without global domains passes
    /// just the current cluster.
    #[must_use]
    pub fn new(
        kind: QueueKind,
        current_cluster: impl Into<String>,
        clusters: Vec<String>,
        storage: Arc<dyn ShardStorage>,
        allocator: Arc<TaskAllocator>,
        task_processor: Arc<dyn TaskProcessor>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let current_cluster = current_cluster.into();
        let mut clusters = clusters;
        if !clusters.contains(&current_cluster) {
            clusters.push(current_cluster.clone());
        }

        Arc::new(Self {
            kind,
            current_cluster,
            clusters,
            storage,
            allocator,
            task_processor,
            config,
            status: Mutex::new(Status::Initialized),
            active: Mutex::new(None),
            standby: Mutex::new(HashMap::new()),
            failover: Mutex::new(HashMap::new()),
            completer_shutdown: Arc::new(Toggle::new()),
            completer_signal: Arc::new(WakeSignal::new()),
            completer_done: Arc::new(Toggle::new()),
            completer_done_signal: Arc::new(WakeSignal::new()),
            completer_join: Mutex::new(None),
        })
    }
}

// --- lifecycle

impl QueueProcessor {
    /// Idempotent start: spawns the active processor, all standby
    /// processors, and the completion loop.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            if *status != Status::Initialized {
                return Ok(());
            }
            *status = Status::Started;
        }

        let result = self.start_processors();
        if let Err(err) = result {
            tracing::error!(error = %err, "queue processor failed to start, rolling back");
            self.halt_processors();
            *self.status.lock().expect("status lock poisoned") = Status::Stopped;
            return Err(err);
        }

        let this = self.clone();
        let join = thread::Builder::new()
            .name(format!("taskloom-completer-{}", self.kind))
            .spawn(move || this.completion_loop())
            .expect("completion thread spawns");
        *self
            .completer_join
            .lock()
            .expect("completer join lock poisoned") = Some(join);

        tracing::info!(kind = %self.kind, cluster = self.current_cluster, "queue processor started");
        Ok(())
    }

    fn start_processors(self: &Arc<Self>) -> Result<(), EngineError> {
        let active_gate = match self.kind {
            QueueKind::Timer => GateKind::Local,
            QueueKind::Transfer => GateKind::Open,
        };
        let cohort: Arc<dyn ProcessorCohort> = Arc::new(ActiveCohort::new(
            self.kind,
            self.current_cluster.clone(),
            self.storage.clone(),
            self.allocator.clone(),
        ));
        let active = spawn_processor(self.spec(cohort, active_gate))?;
        *self.active.lock().expect("active lock poisoned") = Some(active);

        let standby_gate = match self.kind {
            QueueKind::Timer => GateKind::Remote,
            QueueKind::Transfer => GateKind::Open,
        };
        for cluster in &self.clusters {
            if cluster == &self.current_cluster {
                continue;
            }
            let cohort: Arc<dyn ProcessorCohort> = Arc::new(StandbyCohort::new(
                self.kind,
                cluster.clone(),
                self.storage.clone(),
                self.allocator.clone(),
            ));
            let handle = spawn_processor(self.spec(cohort, standby_gate))?;
            self.standby
                .lock()
                .expect("standby lock poisoned")
                .insert(cluster.clone(), handle);
        }
        Ok(())
    }

    fn spec(&self, cohort: Arc<dyn ProcessorCohort>, gate_kind: GateKind) -> ProcessorSpec {
        ProcessorSpec {
            kind: self.kind,
            cohort,
            storage: self.storage.clone(),
            task_processor: self.task_processor.clone(),
            config: self.config.clone(),
            gate_kind,
        }
    }

    /// Idempotent stop: halts every sub-processor, then waits out the
    /// completion loop's final attempt (capped at one minute).
    pub fn stop(&self) {
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            if *status != Status::Started {
                return;
            }
            *status = Status::Stopped;
        }

        self.halt_processors();

        if self.completer_shutdown.turn_on() {
            self.completer_signal.notify();
        }
        let deadline = Instant::now() + STOP_COMPLETION_WAIT;
        while !self.completer_done.probe() && Instant::now() < deadline {
            self.completer_done_signal.wait_until(Some(deadline));
        }
        let join = self
            .completer_join
            .lock()
            .expect("completer join lock poisoned")
            .take();
        if let Some(join) = join {
            if self.completer_done.probe() {
                if join.join().is_err() {
                    tracing::error!("completion loop panicked");
                }
            } else {
                tracing::warn!("completion loop did not finish in time, detaching");
            }
        }

        tracing::info!(kind = %self.kind, "queue processor stopped");
    }

    fn halt_processors(&self) {
        let failover: Vec<_> = self
            .failover
            .lock()
            .expect("failover lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in failover {
            handle.stop();
        }

        let standby: Vec<_> = self
            .standby
            .lock()
            .expect("standby lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in standby {
            handle.stop();
        }

        let active = self.active.lock().expect("active lock poisoned").take();
        if let Some(handle) = active {
            handle.stop();
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        *self.status.lock().expect("status lock poisoned") == Status::Started
    }
}

// --- host-facing operations

impl QueueProcessor {
    /// Routes a new-task notification to the right processor. For the
    /// current cluster that is the active processor; for remote
    /// clusters the matching standby, whose remote clock advances to
    /// the notification's timestamps first.
    pub fn notify_new_task(&self, cluster: &str, tasks: &[TaskInfo]) -> Result<(), EngineError> {
        if tasks.is_empty() {
            tracing::debug!(cluster, "empty task notification ignored");
            return Ok(());
        }
        if !self.is_started() {
            return Ok(());
        }

        if cluster == self.current_cluster {
            let active = self.active.lock().expect("active lock poisoned").clone();
            let Some(handle) = active else {
                return Ok(());
            };
            if self.kind == QueueKind::Timer {
                if let Some(earliest) = tasks.iter().filter_map(|t| t.key.visibility()).min() {
                    handle.gate().update(earliest);
                }
            }
            handle.notify_new_tasks();
            return Ok(());
        }

        let handle = self
            .standby
            .lock()
            .expect("standby lock poisoned")
            .get(cluster)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCluster(cluster.to_string()))?;
        if self.kind == QueueKind::Timer {
            let visibilities: Vec<_> =
                tasks.iter().filter_map(|t| t.key.visibility()).collect();
            if let Some(cluster_time) = visibilities.iter().max() {
                handle.gate().set_current_time(*cluster_time);
            }
            if let Some(earliest) = visibilities.iter().min() {
                handle.gate().update(*earliest);
            }
        }
        handle.notify_new_tasks();
        Ok(())
    }

    /// Mints a failover processor sweeping `(min cluster ack, max
    /// active read level + one tick]` for the given domains. Returns
    /// the failover id, or `None` when the processor is not running
    /// (nothing in flight to drain).
    pub fn failover_domains(
        &self,
        domain_ids: BTreeSet<String>,
    ) -> Result<Option<String>, EngineError> {
        if !self.is_started() {
            return Ok(None);
        }

        // minimum over every cluster's persisted ack level; clusters
        // without a record count as unstarted
        let mut min_level: Option<TaskKey> = None;
        for cluster in &self.clusters {
            let ack = self.storage.cluster_ack_level(self.kind, cluster)?;
            min_level = Some(min_level.map_or(ack, |current| current.min(ack)));
        }
        for ack in self.storage.all_cluster_ack_levels(self.kind)?.into_values() {
            min_level = Some(min_level.map_or(ack, |current| current.min(ack)));
        }
        let min_level = min_level.unwrap_or_else(|| TaskKey::min_sentinel(self.kind));

        let active = self.active.lock().expect("active lock poisoned").clone();
        let Some(active) = active else {
            return Err(EngineError::Shutdown);
        };
        let states = match active.handle_action(QueueAction::GetState, ACTION_TIMEOUT)? {
            ActionOutcome::State(states) => states,
            ActionOutcome::ResetDone => Vec::new(),
        };
        let max_read = states
            .iter()
            .map(|state| state.read_level())
            .max()
            .unwrap_or(min_level);
        let max_level = max_read.next_tick();

        let failover_id = random_failover_id();
        let cohort = FailoverCohort::new(
            self.kind,
            failover_id.clone(),
            domain_ids.clone(),
            min_level,
            max_level,
            Utc::now(),
            self.storage.clone(),
            self.allocator.clone(),
        );
        // the record must exist before the sweep starts so the
        // completion loop includes it in the global minimum
        cohort.persist_ack_level(min_level)?;

        let gate_kind = match self.kind {
            QueueKind::Timer => GateKind::Local,
            QueueKind::Transfer => GateKind::Open,
        };
        let handle = spawn_processor(self.spec(Arc::new(cohort), gate_kind))?;
        handle.notify_new_tasks();
        self.failover
            .lock()
            .expect("failover lock poisoned")
            .insert(failover_id.clone(), handle);

        tracing::info!(
            kind = %self.kind,
            failover_id,
            domains = ?domain_ids,
            min = %min_level,
            max = %max_level,
            "failover processor started"
        );
        Ok(Some(failover_id))
    }

    /// Posts an out-of-band action to the named cluster's processor.
    pub fn handle_action(
        &self,
        cluster: &str,
        action: QueueAction,
    ) -> Result<ActionOutcome, EngineError> {
        let handle = if cluster == self.current_cluster {
            self.active.lock().expect("active lock poisoned").clone()
        } else {
            let standby = self.standby.lock().expect("standby lock poisoned");
            match standby.get(cluster) {
                Some(handle) => Some(handle.clone()),
                None => return Err(EngineError::UnknownCluster(cluster.to_string())),
            }
        };

        match handle {
            Some(handle) => handle.handle_action(action, ACTION_TIMEOUT),
            None => Err(EngineError::Shutdown),
        }
    }

    /// Pauses task-filter decisions while domain ownership flips.
    pub fn lock_task_processing(&self) {
        self.allocator.pause_processing();
    }

    pub fn unlock_task_processing(&self) {
        self.allocator.resume_processing();
    }
}

// --- completion loop

impl QueueProcessor {
    fn completion_loop(self: Arc<Self>) {
        tracing::debug!(kind = %self.kind, "completion loop started");
        let mut rng = ChaCha8Rng::seed_from_u64(rand::random::<u64>());

        loop {
            let wait = jittered(
                self.config.complete_interval.get(),
                self.config.complete_interval_jitter.get(),
                &mut rng,
            );
            self.completer_signal
                .wait_until(Some(Instant::now() + wait));
            if self.completer_shutdown.probe() {
                break;
            }

            match self.complete_pass() {
                Ok(()) => {}
                Err(EngineError::Shutdown) => break,
                Err(EngineError::Storage(StorageError::ShardClosed)) => {
                    tracing::error!(kind = %self.kind, "shard closed, shutting the queue down");
                    let this = self.clone();
                    thread::spawn(move || this.stop());
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "completion pass failed");
                }
            }
            self.prune_failover_handles();
        }

        // final attempt; a shutdown sentinel here is expected
        if let Err(err) = self.complete_pass() {
            tracing::debug!(error = %err, "final completion attempt did not run");
        }

        self.completer_done.turn_on();
        self.completer_done_signal.notify();
        tracing::debug!(kind = %self.kind, "completion loop stopped");
    }

    /// One completion round: gather every processor's ack levels,
    /// take the global minimum, and range-delete up to it.
    fn complete_pass(&self) -> Result<(), EngineError> {
        let mut acks: Vec<TaskKey> = Vec::new();

        let active = self.active.lock().expect("active lock poisoned").clone();
        let Some(active) = active else {
            return Err(EngineError::Shutdown);
        };
        if let ActionOutcome::State(states) =
            active.handle_action(QueueAction::GetState, ACTION_TIMEOUT)?
        {
            acks.extend(states.iter().map(|state| state.ack_level()));
        }

        let standby: Vec<_> = self
            .standby
            .lock()
            .expect("standby lock poisoned")
            .values()
            .cloned()
            .collect();
        for handle in standby {
            if let ActionOutcome::State(states) =
                handle.handle_action(QueueAction::GetState, ACTION_TIMEOUT)?
            {
                acks.extend(states.iter().map(|state| state.ack_level()));
            }
        }

        for record in self.storage.failover_levels(self.kind)?.into_values() {
            acks.push(record.ack_level);
        }

        // an empty gather means queue progress was lost somewhere;
        // nothing sane can continue from here
        assert!(
            !acks.is_empty(),
            "completion loop found no ack level to aggregate"
        );
        let new_ack = acks.into_iter().min().expect("acks not empty");

        let completed = self.storage.completed_level(self.kind)?;
        if new_ack <= completed {
            return Ok(());
        }

        let retry_cap = self.config.complete_failure_retry_count.get();
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .storage
                .range_complete(self.kind, completed, new_ack)
                .and_then(|deleted| {
                    tracing::debug!(
                        kind = %self.kind,
                        deleted,
                        up_to = %new_ack,
                        "range completed acked tasks"
                    );
                    self.storage.set_completed_level(self.kind, new_ack)
                });
            match result {
                Ok(()) => return Ok(()),
                Err(StorageError::ShardClosed) => {
                    return Err(EngineError::Storage(StorageError::ShardClosed));
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > retry_cap {
                        return Err(err.into());
                    }
                    thread::sleep(COMPLETE_RETRY_BASE * attempt);
                }
            }
        }
    }

    /// Failover processors delete their own record when they drain;
    /// drop the matching handles once the records are gone.
    fn prune_failover_handles(&self) {
        let Ok(records) = self.storage.failover_levels(self.kind) else {
            return;
        };
        let mut failover = self.failover.lock().expect("failover lock poisoned");
        let finished: Vec<String> = failover
            .keys()
            .filter(|id| !records.contains_key(*id))
            .cloned()
            .collect();
        for id in finished {
            if let Some(handle) = failover.remove(&id) {
                handle.stop();
                tracing::debug!(failover_id = id, "failover processor retired");
            }
        }
    }
}

fn random_failover_id() -> String {
    (0..16)
        .map(|_| char::from_digit(u32::from(fastrand::u8(0..16)), 16).expect("nibble is hex"))
        .collect()
}
