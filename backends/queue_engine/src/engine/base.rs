// The shared processor loop. One cooperative worker per processor:
// it polls the storage stream for the active queue of every level,
// tracks outstanding tasks, sweeps ack levels, drives splits, and
// answers actions. Queue collections are owned by this thread alone;
// the outside world talks through the event channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{jittered, QueueConfig};
use crate::gates::{LocalTimerGate, OpenGate, RemoteTimerGate, TimerGate};
use crate::keys::{QueueKind, TaskKey};
use crate::limiter::RateGate;
use crate::queues::split::{
    AggregatedSplitPolicy, LookaheadFn, PendingTaskSplitPolicy, RandomSplitPolicy,
    StuckTaskSplitPolicy,
};
use crate::queues::{ProcessingQueue, QueueCollection, QueueState};
use crate::redispatch::Redispatcher;
use crate::storage::{ShardStorage, StorageError};
use crate::tasks::{NackSink, QueueTask, TaskProcessor};
use crate::wakeups::{event_channel, ChannelError, EventReceiver, EventSender, Toggle, WakeSignal};

use super::actions::{ActionEnvelope, ActionOutcome, QueueAction};
use super::cohort::ProcessorCohort;
use super::EngineError;

/// Which timer gate a processor runs behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Transfer queues: nothing to hold back.
    Open,
    /// Timer queues fired by the wall clock.
    Local,
    /// Timer queues fired by a caller-fed remote clock.
    Remote,
}

pub enum ProcessorEvent {
    NewTasks,
    Action(ActionEnvelope),
}

/// Handle to a running processor loop. Owning it does not keep the
/// loop alive; `stop` does an orderly join.
pub struct ProcessorHandle {
    label: String,
    events: EventSender<ProcessorEvent>,
    gate: Arc<dyn TimerGate>,
    shutdown: Arc<Toggle>,
    signal: Arc<WakeSignal>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Everything a processor loop is built from.
pub struct ProcessorSpec {
    pub kind: QueueKind,
    pub cohort: Arc<dyn ProcessorCohort>,
    pub storage: Arc<dyn ShardStorage>,
    pub task_processor: Arc<dyn TaskProcessor>,
    pub config: QueueConfig,
    pub gate_kind: GateKind,
}

/// Loads initial state and spawns the loop thread.
pub fn spawn_processor(spec: ProcessorSpec) -> Result<Arc<ProcessorHandle>, EngineError> {
    let label = spec.cohort.label();
    let load_persisted = spec.config.enable_load_queue_states.get();
    let initial_states = spec.cohort.initial_states(load_persisted)?;

    let signal = Arc::new(WakeSignal::new());
    let gate: Arc<dyn TimerGate> = match spec.gate_kind {
        GateKind::Open => Arc::new(OpenGate),
        GateKind::Local => Arc::new(LocalTimerGate::new(signal.clone())),
        GateKind::Remote => Arc::new(RemoteTimerGate::new(signal.clone())),
    };
    let (events, receiver) = event_channel(signal.clone());
    let shutdown = Arc::new(Toggle::new());

    let redispatcher = Redispatcher::new(
        spec.task_processor.clone(),
        spec.config.redispatch_interval.clone(),
        spec.config.redispatch_interval_jitter.clone(),
        spec.config.max_redispatch_queue_size.clone(),
    );
    let redispatch_thread = redispatcher.start(&label);

    let core = LoopCore::new(spec, initial_states, gate.clone(), receiver, shutdown.clone(), redispatcher);

    let thread_label = label.clone();
    let join = thread::Builder::new()
        .name(format!("taskloom-queue-{thread_label}"))
        .spawn(move || {
            core.run();
            if redispatch_thread.join().is_err() {
                tracing::error!("redispatch thread panicked");
            }
        })
        .expect("processor thread spawns");

    Ok(Arc::new(ProcessorHandle {
        label,
        events,
        gate,
        shutdown,
        signal,
        join: Mutex::new(Some(join)),
    }))
}

// --- handle methods

impl ProcessorHandle {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<dyn TimerGate> {
        &self.gate
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.probe()
    }

    /// Signals that new tasks landed in the stream.
    pub fn notify_new_tasks(&self) {
        let _ = self.events.send(ProcessorEvent::NewTasks);
    }

    /// Posts an action and blocks for the loop's answer.
    pub fn handle_action(
        &self,
        action: QueueAction,
        timeout: Duration,
    ) -> Result<ActionOutcome, EngineError> {
        if self.shutdown.probe() {
            return Err(EngineError::Shutdown);
        }

        let (reply, receiver) = crate::wakeups::reply_slot();
        self.events
            .send(ProcessorEvent::Action(ActionEnvelope { action, reply }))
            .map_err(|_| EngineError::Shutdown)?;

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(ChannelError::Timeout) => {
                if self.shutdown.probe() {
                    Err(EngineError::Shutdown)
                } else {
                    Err(EngineError::ActionTimeout)
                }
            }
            Err(ChannelError::Closed) => Err(EngineError::Shutdown),
        }
    }

    /// Idempotent orderly stop; joins the loop thread.
    pub fn stop(&self) {
        if self.shutdown.turn_on() {
            self.signal.notify();
        }
        let handle = self.join.lock().expect("join lock poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(label = self.label, "processor loop panicked");
            }
        }
    }
}

// --- the loop itself

struct LoopCore {
    kind: QueueKind,
    cohort: Arc<dyn ProcessorCohort>,
    storage: Arc<dyn ShardStorage>,
    task_processor: Arc<dyn TaskProcessor>,
    config: QueueConfig,
    gate: Arc<dyn TimerGate>,
    events: EventReceiver<ProcessorEvent>,
    shutdown: Arc<Toggle>,
    redispatcher: Arc<Redispatcher>,
    rate_gate: RateGate,
    split_policy: AggregatedSplitPolicy,
    rng: ChaCha8Rng,

    collections: BTreeMap<usize, QueueCollection>,
    next_poll: HashMap<usize, Instant>,
    next_update_ack: Instant,
    next_split: Instant,
}

impl LoopCore {
    fn new(
        spec: ProcessorSpec,
        initial_states: Vec<QueueState>,
        gate: Arc<dyn TimerGate>,
        events: EventReceiver<ProcessorEvent>,
        shutdown: Arc<Toggle>,
        redispatcher: Arc<Redispatcher>,
    ) -> Self {
        let ProcessorSpec {
            kind,
            cohort,
            storage,
            task_processor,
            config,
            gate_kind: _,
        } = spec;

        let mut rng = ChaCha8Rng::seed_from_u64(rand::random::<u64>());

        let mut collections: BTreeMap<usize, QueueCollection> = BTreeMap::new();
        for state in initial_states {
            let level = state.level();
            collections
                .entry(level)
                .or_insert_with(|| QueueCollection::new(level, Vec::new()))
                .absorb(ProcessingQueue::new(state));
        }

        let now = Instant::now();
        let next_poll = collections.keys().map(|level| (*level, now)).collect();
        let next_update_ack = now
            + jittered(
                config.update_ack_interval.get(),
                config.update_ack_interval_jitter.get(),
                &mut rng,
            );
        let next_split = now
            + jittered(
                config.split_queue_interval.get(),
                config.split_queue_interval_jitter.get(),
                &mut rng,
            );

        let lookahead = build_lookahead(kind, storage.clone(), &config);
        let split_policy = AggregatedSplitPolicy::new(vec![
            Box::new(PendingTaskSplitPolicy::new(
                config.pending_task_split_threshold.clone(),
                config.split_max_level.clone(),
                lookahead.clone(),
            )),
            Box::new(StuckTaskSplitPolicy::new(
                config.stuck_task_split_threshold.clone(),
                config.split_max_level.clone(),
                lookahead.clone(),
            )),
            Box::new(RandomSplitPolicy::new(
                config.random_split_probability.clone(),
                config.enable_random_split_by_domain.clone(),
                config.split_max_level.clone(),
                lookahead,
                ChaCha8Rng::seed_from_u64(rand::random::<u64>()),
            )),
        ]);

        Self {
            kind,
            cohort,
            storage,
            task_processor,
            rate_gate: RateGate::new(config.max_poll_rps.clone()),
            config,
            gate,
            events,
            shutdown,
            redispatcher,
            split_policy,
            rng,
            collections,
            next_poll,
            next_update_ack,
            next_split,
        }
    }

    fn run(mut self) {
        tracing::debug!(label = self.cohort.label(), "queue processor started");

        while !self.shutdown.probe() {
            for event in self.events.drain() {
                match event {
                    ProcessorEvent::NewTasks => self.on_new_tasks(),
                    ProcessorEvent::Action(envelope) => self.on_action(envelope),
                }
            }
            if self.shutdown.probe() {
                break;
            }

            if self.gate.poll_fired() {
                // due timers exist somewhere below the gate target
                let now = Instant::now();
                for slot in self.next_poll.values_mut() {
                    *slot = now;
                }
            }

            let now = Instant::now();
            let due: Vec<usize> = self
                .next_poll
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(level, _)| *level)
                .collect();
            for level in due {
                self.poll_level(level);
                if self.shutdown.probe() {
                    break;
                }
            }

            if Instant::now() >= self.next_update_ack {
                self.update_ack_tick();
                self.next_update_ack = Instant::now()
                    + jittered(
                        self.config.update_ack_interval.get(),
                        self.config.update_ack_interval_jitter.get(),
                        &mut self.rng,
                    );
            }
            if Instant::now() >= self.next_split {
                self.split_tick();
                self.next_split = Instant::now()
                    + jittered(
                        self.config.split_queue_interval.get(),
                        self.config.split_queue_interval_jitter.get(),
                        &mut self.rng,
                    );
            }

            if self.collections.is_empty() {
                // all queues drained; the only exit a failover
                // processor ever takes
                if let Err(err) = self.cohort.queue_shutdown() {
                    tracing::warn!(error = %err, "queue shutdown hook failed");
                }
                self.shutdown.turn_on();
                break;
            }

            let deadline = self.next_deadline();
            self.events.signal().wait_until(deadline);
        }

        self.drain_on_exit();
        tracing::debug!(label = self.cohort.label(), "queue processor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.next_update_ack.min(self.next_split);
        if let Some(poll) = self.next_poll.values().min() {
            deadline = deadline.min(*poll);
        }
        if let Some(hint) = self.gate.wait_hint() {
            deadline = deadline.min(Instant::now() + hint);
        }
        Some(deadline)
    }

    /// New tasks land above every prior read level, so only queues
    /// whose range is unbounded above can see them.
    fn on_new_tasks(&mut self) {
        let now = Instant::now();
        let sentinel = TaskKey::max_sentinel(self.kind);
        for (level, collection) in &self.collections {
            let covers_new = collection
                .active_queue()
                .is_some_and(|queue| queue.state().max_level() == sentinel);
            if covers_new {
                self.next_poll.insert(*level, now);
            }
        }
    }

    fn on_action(&mut self, envelope: ActionEnvelope) {
        let ActionEnvelope { action, reply } = envelope;
        match action {
            QueueAction::GetState => {
                let mut states = Vec::new();
                for collection in self.collections.values() {
                    states.extend(collection.states());
                }
                reply.send(Ok(ActionOutcome::State(states)));
            }
            QueueAction::Reset => {
                if !self.cohort.allows_reset() {
                    reply.send(Err(EngineError::NotSupported(
                        "reset of a failover processor",
                    )));
                    return;
                }
                reply.send(self.reset_queues().map(|()| ActionOutcome::ResetDone));
            }
        }
    }

    /// Collapses everything into one level-0 full-range queue at the
    /// current minimum ack level. Outstanding tasks are dropped and
    /// re-read.
    fn reset_queues(&mut self) -> Result<(), EngineError> {
        let min_ack = self
            .collections
            .values()
            .flat_map(|collection| collection.states())
            .map(|state| state.ack_level())
            .min()
            .unwrap_or_else(|| TaskKey::min_sentinel(self.kind));

        let state = QueueState::new(
            0,
            min_ack,
            min_ack,
            TaskKey::max_sentinel(self.kind),
            crate::domains::DomainFilter::all(),
        )?;

        tracing::info!(
            label = self.cohort.label(),
            ack = %min_ack,
            "resetting processing queues to a single level-0 queue"
        );
        self.collections.clear();
        self.collections
            .insert(0, QueueCollection::new(0, vec![ProcessingQueue::new(state)]));
        self.next_poll.clear();
        self.next_poll.insert(0, Instant::now());
        Ok(())
    }

    fn max_poll_wait(&mut self) -> Duration {
        jittered(
            self.config.max_poll_interval.get(),
            self.config.max_poll_interval_jitter.get(),
            &mut self.rng,
        )
    }

    fn backoff_wait(&mut self) -> Duration {
        jittered(
            self.config.poll_backoff_interval.get(),
            self.config.poll_backoff_interval_jitter.get(),
            &mut self.rng,
        )
    }

    fn poll_level(&mut self, level: usize) {
        let now = Instant::now();

        // settle what to do while the collection borrow is short
        let coordinates = match self.collections.get(&level) {
            None => {
                self.next_poll.remove(&level);
                return;
            }
            Some(collection) => collection
                .active_queue()
                .filter(|active| active.has_unread_range())
                .map(|active| (active.state().read_level(), active.state().max_level())),
        };
        let Some((read_level, queue_max)) = coordinates else {
            let wait = self.max_poll_wait();
            self.next_poll.insert(level, now + wait);
            return;
        };

        if let Err(wait) = self.rate_gate.try_take() {
            self.next_poll.insert(level, now + wait);
            return;
        }

        // refresh the shard horizon before the read
        let shard_max = self.cohort.max_read_level();
        let upper = queue_max.min(shard_max);
        if upper <= read_level {
            let wait = self.max_poll_wait();
            self.next_poll.insert(level, now + wait);
            return;
        }

        let batch_size = self.config.batch_size.get();
        let page = match self
            .storage
            .get_tasks(self.kind, read_level, upper, batch_size, None)
        {
            Ok(page) => page,
            Err(StorageError::ShardClosed) => {
                tracing::error!(label = self.cohort.label(), "shard closed, stopping");
                self.shutdown.turn_on();
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, level, "task read failed, backing off");
                let wait = self.backoff_wait();
                self.next_poll.insert(level, now + wait);
                return;
            }
        };

        let mut filter_failed = false;
        let mut new_tasks: Vec<Arc<QueueTask>> = Vec::with_capacity(page.tasks.len());
        let sink: Arc<dyn NackSink> = self.redispatcher.clone();
        for info in page.tasks {
            let task = Arc::new(QueueTask::new(info, Utc::now()));
            task.set_priority(u32::try_from(level).unwrap_or(u32::MAX));
            task.attach_nack_sink(&sink);
            match self.cohort.task_filter(task.info()) {
                Ok(should_process) => task.set_should_process(Some(should_process)),
                Err(err) => {
                    // verdict unknown: track the task but hold the
                    // submit until the filter answers
                    tracing::warn!(error = %err, key = %task.key(), "task filter failed");
                    filter_failed = true;
                }
            }
            new_tasks.push(task);
        }

        let page_was_empty = new_tasks.is_empty();
        let has_more = page.next_page.is_some();
        let new_read_level = if has_more {
            new_tasks
                .last()
                .map_or(upper, |task| task.key())
        } else {
            upper
        };

        for task in &new_tasks {
            if task.should_process().is_none() {
                continue;
            }
            match self.task_processor.try_submit(task.clone()) {
                Ok(true) => {}
                Ok(false) => self.redispatcher.add(task.clone()),
                Err(err) => {
                    tracing::debug!(error = %err, "submit refused, redispatching");
                    self.redispatcher.add(task.clone());
                }
            }
        }

        let Some(collection) = self.collections.get_mut(&level) else {
            return;
        };
        if let Err(err) = collection.add_tasks_to_active(new_tasks, new_read_level) {
            tracing::error!(error = %err, level, "failed to track read tasks");
        }

        if self.kind == QueueKind::Timer && !has_more && upper < queue_max {
            self.look_ahead(upper, queue_max);
        }

        let next = if filter_failed || page_was_empty {
            // filter trouble and empty batches both back off briefly
            now + self.backoff_wait()
        } else if has_more || upper == queue_max {
            // more pages, or this queue's range is finished: continue
            // immediately
            now
        } else {
            now + self.max_poll_wait()
        };
        self.next_poll.insert(level, next);
    }

    /// Finds the next timer beyond the horizon and arms the gate so
    /// the loop wakes exactly when it comes due.
    fn look_ahead(&mut self, from: TaskKey, to: TaskKey) {
        match self.storage.get_tasks(self.kind, from, to, 1, None) {
            Ok(page) => {
                if let Some(next_timer) = page.tasks.first() {
                    if let Some(visibility) = next_timer.key.visibility() {
                        self.gate.update(visibility);
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "timer look-ahead failed");
            }
        }
    }

    fn update_ack_tick(&mut self) {
        // tasks whose ownership lookup failed at read time get a
        // fresh verdict before the sweep
        for collection in self.collections.values() {
            for task in collection.unfiltered_tasks() {
                match self.cohort.task_filter(task.info()) {
                    Ok(should_process) => {
                        task.set_should_process(Some(should_process));
                        match self.task_processor.try_submit(task.clone()) {
                            Ok(true) => {}
                            Ok(false) | Err(_) => self.redispatcher.add(task),
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "task filter still failing");
                    }
                }
            }
        }

        let mut min_ack: Option<TaskKey> = None;
        let mut drained_levels = Vec::new();
        for (level, collection) in &mut self.collections {
            match collection.update_ack_levels() {
                Some(ack) => {
                    min_ack = Some(min_ack.map_or(ack, |current| current.min(ack)));
                }
                None => drained_levels.push(*level),
            }
        }
        for level in drained_levels {
            self.collections.remove(&level);
            self.next_poll.remove(&level);
        }

        let result = if self.config.enable_persist_queue_states.get() {
            let states = self
                .collections
                .values()
                .flat_map(QueueCollection::states)
                .map(|state| state.to_persisted())
                .collect();
            self.cohort.persist_queue_states(states)
        } else {
            match min_ack {
                Some(ack) => self.cohort.persist_ack_level(ack),
                None => Ok(()),
            }
        };
        match result {
            Ok(()) => {}
            Err(StorageError::ShardClosed) => {
                tracing::error!(label = self.cohort.label(), "shard closed, stopping");
                self.shutdown.turn_on();
            }
            Err(err) => {
                tracing::warn!(error = %err, "ack level persistence failed, will retry");
            }
        }
    }

    fn split_tick(&mut self) {
        if !self.config.enable_split.get() {
            return;
        }

        let mut emigrants: Vec<ProcessingQueue> = Vec::new();
        for collection in self.collections.values_mut() {
            emigrants.extend(collection.split(&self.split_policy));
        }

        let now = Instant::now();
        for queue in emigrants {
            let level = queue.state().level();
            self.collections
                .entry(level)
                .or_insert_with(|| QueueCollection::new(level, Vec::new()))
                .absorb(queue);
            self.next_poll.entry(level).or_insert(now);
        }
    }

    fn drain_on_exit(&mut self) {
        for event in self.events.drain() {
            if let ProcessorEvent::Action(envelope) = event {
                envelope.reply.send(Err(EngineError::Shutdown));
            }
        }
        self.events.close();
        self.redispatcher.stop();

        // one last progress record so a clean restart resumes close
        // to where we stopped
        self.update_ack_tick();
    }
}

fn build_lookahead(
    kind: QueueKind,
    storage: Arc<dyn ShardStorage>,
    config: &QueueConfig,
) -> LookaheadFn {
    let look_ahead_durations = config.split_look_ahead_duration_by_domain.clone();
    Arc::new(move |domain: &str, _level: usize| match kind {
        QueueKind::Transfer => storage.max_read_level(QueueKind::Transfer),
        QueueKind::Timer => {
            let span = look_ahead_durations.get().for_domain(domain);
            let span = chrono::Duration::from_std(span)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            TaskKey::timer(Utc::now() + span, 0)
        }
    })
}
