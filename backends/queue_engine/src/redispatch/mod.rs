// Redispatcher: the bounded backlog keeping refused or nacked tasks
// alive between natural re-read boundaries. Runs its own drain
// thread on a jittered cadence.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use concurrent_queue::ConcurrentQueue;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{jittered, Dyn};
use crate::tasks::{NackSink, QueueTask, TaskProcessor, TaskState};
use crate::wakeups::{Toggle, WakeSignal};

pub struct Redispatcher {
    backlog: ConcurrentQueue<Arc<QueueTask>>,
    processor: Arc<dyn TaskProcessor>,
    interval: Dyn<std::time::Duration>,
    interval_jitter: Dyn<f64>,
    max_size: Dyn<usize>,
    signal: WakeSignal,
    shutdown: Toggle,
}

// --- constructors

impl Redispatcher {
    #[must_use]
    pub fn new(
        processor: Arc<dyn TaskProcessor>,
        interval: Dyn<std::time::Duration>,
        interval_jitter: Dyn<f64>,
        max_size: Dyn<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backlog: ConcurrentQueue::unbounded(),
            processor,
            interval,
            interval_jitter,
            max_size,
            signal: WakeSignal::new(),
            shutdown: Toggle::new(),
        })
    }
}

// --- methods

impl Redispatcher {
    /// Spawns the drain thread. Named so a stuck shard is findable in
    /// a thread dump.
    pub fn start(self: &Arc<Self>, label: &str) -> thread::JoinHandle<()> {
        let this = self.clone();
        let seed = rand::random::<u64>();
        thread::Builder::new()
            .name(format!("taskloom-redispatch-{label}"))
            .spawn(move || this.run_loop(ChaCha8Rng::seed_from_u64(seed)))
            .expect("redispatch thread spawns")
    }

    pub fn stop(&self) {
        if self.shutdown.turn_on() {
            self.signal.notify();
        }
    }

    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Queues a task for a later re-offer. Over the warn threshold
    /// the drain is kicked immediately instead of waiting the
    /// interval out.
    pub fn add(&self, task: Arc<QueueTask>) {
        if self.backlog.push(task).is_err() {
            // only possible once stopped; the task stays outstanding
            // in its queue and will be re-read
            tracing::debug!("redispatch backlog closed, dropping re-offer");
            return;
        }

        let backlog = self.backlog.len();
        if backlog > self.max_size.get() {
            tracing::warn!(backlog, "redispatch backlog above threshold");
            self.signal.notify();
        }
    }

    fn run_loop(&self, mut rng: ChaCha8Rng) {
        tracing::debug!("redispatcher started");
        loop {
            let wait = jittered(self.interval.get(), self.interval_jitter.get(), &mut rng);
            self.signal.wait_until(Some(Instant::now() + wait));
            if self.shutdown.probe() {
                break;
            }
            self.drain_once();
        }
        self.backlog.close();
        tracing::debug!("redispatcher stopped");
    }

    /// Re-offers up to one backlog's worth of tasks. Tasks that got
    /// acked while waiting are discarded; refusals go back in line.
    pub fn drain_once(&self) {
        let cap = self.backlog.len().min(self.max_size.get().max(1));
        for _ in 0..cap {
            let Ok(task) = self.backlog.pop() else {
                break;
            };
            if task.state() == TaskState::Acked {
                continue;
            }

            task.mark_pending();
            match self.processor.try_submit(task.clone()) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = self.backlog.push(task);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "task processor gone, keeping backlog");
                    let _ = self.backlog.push(task);
                    return;
                }
            }
        }
    }
}

impl NackSink for Redispatcher {
    fn redispatch(&self, task: Arc<QueueTask>) {
        self.add(task);
    }
}
