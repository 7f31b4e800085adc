// Split policies propose partitions of a processing queue so hot or
// stuck domains move to their own queue at a higher level, away from
// the default polling lane.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::{Dyn, LevelThresholds};
use crate::domains::DomainFilter;
use crate::keys::TaskKey;
use crate::tasks::TaskState;

use super::queue::ProcessingQueue;
use super::state::QueueState;

/// Maps a (domain, level) pair to the upper bound of the range a
/// carved-out queue should take with it.
pub type LookaheadFn = Arc<dyn Fn(&str, usize) -> TaskKey + Send + Sync>;

/// A stateless rule proposing how to partition one queue. An empty
/// result means "leave the queue alone".
pub trait SplitPolicy: Send + Sync {
    fn evaluate(&self, queue: &ProcessingQueue) -> Vec<QueueState>;
}

/// Shared carving helper: moves `domains` into their own queue at
/// `new_level` over `(ack, lookahead]`, keeps their tail at the
/// current level, and leaves everything else where it was.
fn carve_domains(
    state: &QueueState,
    domains: &BTreeSet<String>,
    new_level: usize,
    lookahead: TaskKey,
) -> Vec<QueueState> {
    if domains.is_empty() {
        return Vec::new();
    }

    let ack = state.ack_level();
    let max = state.max_level();
    let lookahead = lookahead.max(ack).min(max);
    if lookahead <= ack {
        return Vec::new();
    }

    let carved_filter = DomainFilter::including(domains.iter().cloned());
    let mut remainder_filter = state.domain_filter().clone();
    for domain in domains {
        remainder_filter = remainder_filter.without(domain);
    }

    let mut proposed = Vec::with_capacity(3);
    proposed.push(
        QueueState::new(new_level, ack, ack, lookahead, carved_filter.clone())
            .expect("carved range within queue bounds"),
    );
    if lookahead < max {
        // the carved domains keep their tail at the current level so
        // the union of ranges is preserved per domain
        proposed.push(
            QueueState::new(state.level(), lookahead, lookahead, max, carved_filter)
                .expect("carved tail within queue bounds"),
        );
    }
    proposed.push(
        QueueState::new(state.level(), ack, ack, max, remainder_filter)
            .expect("remainder keeps queue bounds"),
    );
    proposed
}

/// Carves out domains whose outstanding backlog in the queue crossed
/// the per-level threshold.
pub struct PendingTaskSplitPolicy {
    threshold: Dyn<LevelThresholds>,
    max_level: Dyn<usize>,
    lookahead: LookaheadFn,
}

impl PendingTaskSplitPolicy {
    #[must_use]
    pub fn new(
        threshold: Dyn<LevelThresholds>,
        max_level: Dyn<usize>,
        lookahead: LookaheadFn,
    ) -> Self {
        Self {
            threshold,
            max_level,
            lookahead,
        }
    }
}

impl SplitPolicy for PendingTaskSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Vec<QueueState> {
        let state = queue.state();
        if state.level() >= self.max_level.get() {
            return Vec::new();
        }

        let threshold = self.threshold.get().for_level(state.level());
        let mut per_domain: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();
        for task in queue.outstanding().values() {
            if task.state() != TaskState::Acked {
                *per_domain.entry(task.domain_id()).or_default() += 1;
            }
        }

        let overloaded: BTreeSet<String> = per_domain
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .map(|(domain, _)| domain.to_string())
            .collect();
        if overloaded.is_empty() {
            return Vec::new();
        }

        let next_level = state.level() + 1;
        let lookahead = overloaded
            .iter()
            .map(|domain| (self.lookahead)(domain, state.level()))
            .max()
            .expect("overloaded set not empty");

        tracing::info!(
            level = state.level(),
            domains = ?overloaded,
            "pending-task backlog crossed threshold, splitting queue"
        );
        carve_domains(state, &overloaded, next_level, lookahead)
    }
}

/// Carves out domains owning a task that has been attempted more
/// than the per-level threshold allows.
pub struct StuckTaskSplitPolicy {
    threshold: Dyn<LevelThresholds>,
    max_level: Dyn<usize>,
    lookahead: LookaheadFn,
}

impl StuckTaskSplitPolicy {
    #[must_use]
    pub fn new(
        threshold: Dyn<LevelThresholds>,
        max_level: Dyn<usize>,
        lookahead: LookaheadFn,
    ) -> Self {
        Self {
            threshold,
            max_level,
            lookahead,
        }
    }
}

impl SplitPolicy for StuckTaskSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Vec<QueueState> {
        let state = queue.state();
        if state.level() >= self.max_level.get() {
            return Vec::new();
        }

        let threshold = self.threshold.get().for_level(state.level());
        let stuck: BTreeSet<String> = queue
            .outstanding()
            .values()
            .filter(|task| task.attempt() as usize > threshold)
            .map(|task| task.domain_id().to_string())
            .collect();
        if stuck.is_empty() {
            return Vec::new();
        }

        let next_level = state.level() + 1;
        let lookahead = stuck
            .iter()
            .map(|domain| (self.lookahead)(domain, state.level()))
            .max()
            .expect("stuck set not empty");

        tracing::info!(
            level = state.level(),
            domains = ?stuck,
            "stuck tasks detected, isolating domains"
        );
        carve_domains(state, &stuck, next_level, lookahead)
    }
}

/// Occasionally carves out one random domain. Keeps the split path
/// exercised and spreads load without waiting for a threshold.
pub struct RandomSplitPolicy {
    probability: Dyn<f64>,
    enabled: Dyn<bool>,
    max_level: Dyn<usize>,
    lookahead: LookaheadFn,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomSplitPolicy {
    #[must_use]
    pub fn new(
        probability: Dyn<f64>,
        enabled: Dyn<bool>,
        max_level: Dyn<usize>,
        lookahead: LookaheadFn,
        rng: ChaCha8Rng,
    ) -> Self {
        Self {
            probability,
            enabled,
            max_level,
            lookahead,
            rng: Mutex::new(rng),
        }
    }
}

impl SplitPolicy for RandomSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Vec<QueueState> {
        if !self.enabled.get() {
            return Vec::new();
        }
        let state = queue.state();
        if state.level() >= self.max_level.get() {
            return Vec::new();
        }

        let candidates: Vec<&str> = {
            let mut seen = BTreeSet::new();
            queue
                .outstanding()
                .values()
                .map(|task| task.domain_id())
                .filter(|domain| seen.insert(domain.to_string()))
                .collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut rng = self.rng.lock().expect("split rng lock poisoned");
        if rng.random::<f64>() >= self.probability.get() {
            return Vec::new();
        }
        let chosen = candidates[rng.random_range(0..candidates.len())].to_string();
        drop(rng);

        let domains: BTreeSet<String> = [chosen.clone()].into();
        let lookahead = (self.lookahead)(&chosen, state.level());
        carve_domains(state, &domains, state.level() + 1, lookahead)
    }
}

/// Runs inner policies in order; the first non-empty proposal wins.
pub struct AggregatedSplitPolicy {
    policies: Vec<Box<dyn SplitPolicy>>,
}

impl AggregatedSplitPolicy {
    #[must_use]
    pub fn new(policies: Vec<Box<dyn SplitPolicy>>) -> Self {
        Self { policies }
    }
}

impl SplitPolicy for AggregatedSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Vec<QueueState> {
        for policy in &self.policies {
            let proposed = policy.evaluate(queue);
            if !proposed.is_empty() {
                return proposed;
            }
        }
        Vec::new()
    }
}
