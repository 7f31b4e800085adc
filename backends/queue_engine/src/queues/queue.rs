// A processing queue: one published state plus the in-memory map of
// outstanding tasks inside its range.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::keys::{QueueKind, TaskKey};
use crate::tasks::{QueueTask, TaskState};

use super::split::SplitPolicy;
use super::state::{QueueError, QueueState};

pub struct ProcessingQueue {
    state: QueueState,
    outstanding: BTreeMap<TaskKey, Arc<QueueTask>>,
}

// --- constructors

impl ProcessingQueue {
    #[must_use]
    pub fn new(state: QueueState) -> Self {
        Self {
            state,
            outstanding: BTreeMap::new(),
        }
    }

    fn with_tasks(state: QueueState, outstanding: BTreeMap<TaskKey, Arc<QueueTask>>) -> Self {
        Self { state, outstanding }
    }
}

// --- methods

impl ProcessingQueue {
    #[must_use]
    pub fn state(&self) -> &QueueState {
        &self.state
    }

    #[must_use]
    pub fn outstanding(&self) -> &BTreeMap<TaskKey, Arc<QueueTask>> {
        &self.outstanding
    }

    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Range fully acked with nothing tracked: the queue can be
    /// destroyed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.outstanding.is_empty() && self.state.ack_level() >= self.state.max_level()
    }

    /// Whether the poller still has range left to read.
    #[must_use]
    pub fn has_unread_range(&self) -> bool {
        self.state.read_level() < self.state.max_level()
    }

    /// Inserts newly read tasks and advances the read level.
    /// Duplicates from an overlapping split are ignored; anything
    /// outside the range or filter is a caller bug and is rejected.
    pub fn add_tasks(
        &mut self,
        tasks: Vec<Arc<QueueTask>>,
        new_read_level: TaskKey,
    ) -> Result<usize, QueueError> {
        if new_read_level < self.state.read_level() {
            return Err(QueueError::ReadLevelRegressed {
                current: self.state.read_level(),
                proposed: new_read_level,
            });
        }
        if new_read_level > self.state.max_level() {
            return Err(QueueError::InvalidState(format!(
                "read level {new_read_level} beyond max level {}",
                self.state.max_level()
            )));
        }

        let mut added = 0;
        for task in tasks {
            let key = task.key();
            if self.outstanding.contains_key(&key) {
                continue;
            }
            if !self.state.contains(key) {
                return Err(QueueError::TaskOutOfRange {
                    key,
                    ack_level: self.state.ack_level(),
                    max_level: self.state.max_level(),
                });
            }
            if !self.state.domain_filter().matches(task.domain_id()) {
                return Err(QueueError::TaskNotOwned {
                    key,
                    domain_id: task.domain_id().to_string(),
                });
            }
            self.outstanding.insert(key, task);
            added += 1;
        }

        self.state.set_read_level(new_read_level);
        Ok(added)
    }

    /// Sweeps the acked prefix out of the outstanding map and
    /// advances the ack level to the last contiguously acked key.
    /// Timer queues normalize the tiebreaker so completion boundaries
    /// land on timestamp edges.
    pub fn update_ack_level(&mut self) -> TaskKey {
        let mut acked_prefix = Vec::new();
        for (key, task) in &self.outstanding {
            if task.state() != TaskState::Acked {
                break;
            }
            acked_prefix.push(*key);
        }

        let mut new_ack = self.state.ack_level();
        for key in acked_prefix {
            self.outstanding.remove(&key);
            new_ack = key;
        }

        if self.outstanding.is_empty() {
            new_ack = self.state.read_level();
        }

        if new_ack.kind() == QueueKind::Timer {
            new_ack = new_ack.normalized();
        }
        if new_ack > self.state.ack_level() {
            self.state.set_ack_level(new_ack);
        }
        self.state.ack_level()
    }

    /// Applies a split policy. A rejected or impossible proposal
    /// leaves the queue untouched; otherwise the outstanding tasks
    /// are repartitioned across the proposed states.
    #[must_use]
    pub fn split(self, policy: &dyn SplitPolicy) -> Vec<ProcessingQueue> {
        let proposed = policy.evaluate(&self);
        if proposed.is_empty() {
            return vec![self];
        }

        for state in &proposed {
            let inside = state.ack_level() >= self.state.ack_level()
                && state.max_level() <= self.state.max_level();
            if !inside {
                tracing::warn!(
                    proposed = %state.ack_level(),
                    "split proposal escapes queue range, aborting split"
                );
                return vec![self];
            }
            if !self.state.domain_filter().covers(state.domain_filter()) {
                tracing::warn!(
                    proposed = %state.ack_level(),
                    "split proposal claims domains the queue does not own, aborting split"
                );
                return vec![self];
            }
        }

        // repartition: every outstanding task must land in exactly one
        // proposed state
        let mut buckets: Vec<BTreeMap<TaskKey, Arc<QueueTask>>> =
            proposed.iter().map(|_| BTreeMap::new()).collect();
        for (key, task) in &self.outstanding {
            let mut target = None;
            for (index, state) in proposed.iter().enumerate() {
                if state.contains(*key) && state.domain_filter().matches(task.domain_id()) {
                    target = Some(index);
                    break;
                }
            }
            match target {
                Some(index) => {
                    buckets[index].insert(*key, task.clone());
                }
                None => {
                    tracing::warn!(
                        key = %key,
                        domain_id = task.domain_id(),
                        "task fits no split target, aborting split"
                    );
                    return vec![self];
                }
            }
        }

        let original_read = self.state.read_level();
        proposed
            .into_iter()
            .zip(buckets)
            .map(|(state, tasks)| {
                // a task previously read remains read in its new home
                let read = original_read
                    .max(state.ack_level())
                    .min(state.max_level());
                let state = QueueState::new(
                    state.level(),
                    state.ack_level(),
                    read,
                    state.max_level(),
                    state.domain_filter().clone(),
                )
                .expect("split state bounds already validated");
                ProcessingQueue::with_tasks(state, tasks)
            })
            .collect()
    }

    /// Merges two same-level queues with overlapping ranges into up
    /// to three disjoint queues covering the union of both ranges.
    /// Non-overlapping or differently-leveled inputs come back
    /// unchanged.
    #[must_use]
    pub fn merge(self, other: ProcessingQueue) -> Vec<ProcessingQueue> {
        if self.state.level() != other.state.level() || !self.state.overlaps(&other.state) {
            return vec![self, other];
        }

        let (a, b) = if self.state.ack_level() <= other.state.ack_level() {
            (self, other)
        } else {
            (other, self)
        };

        let level = a.state.level();
        let overlap_end = a.state.max_level().min(b.state.max_level());
        let union_end = a.state.max_level().max(b.state.max_level());

        struct Part {
            ack: TaskKey,
            max: TaskKey,
            filter: crate::domains::DomainFilter,
            reads: Vec<TaskKey>,
        }

        let mut parts = Vec::new();
        if a.state.ack_level() < b.state.ack_level() {
            parts.push(Part {
                ack: a.state.ack_level(),
                max: b.state.ack_level(),
                filter: a.state.domain_filter().clone(),
                reads: vec![a.state.read_level()],
            });
        }
        if b.state.ack_level() < overlap_end {
            parts.push(Part {
                ack: b.state.ack_level(),
                max: overlap_end,
                filter: a.state.domain_filter().merge(b.state.domain_filter()),
                reads: vec![a.state.read_level(), b.state.read_level()],
            });
        }
        if overlap_end < union_end {
            let tail_filter = if a.state.max_level() > b.state.max_level() {
                a.state.domain_filter().clone()
            } else {
                b.state.domain_filter().clone()
            };
            let tail_read = if a.state.max_level() > b.state.max_level() {
                a.state.read_level()
            } else {
                b.state.read_level()
            };
            parts.push(Part {
                ack: overlap_end,
                max: union_end,
                filter: tail_filter,
                reads: vec![tail_read],
            });
        }

        let mut merged: Vec<ProcessingQueue> = parts
            .into_iter()
            .map(|part| {
                // no data is lost: within each part the read level is
                // the most conservative of the contributing queues
                let read = part
                    .reads
                    .iter()
                    .map(|read| (*read).max(part.ack).min(part.max))
                    .min()
                    .unwrap_or(part.ack);
                let state = QueueState::new(level, part.ack, read, part.max, part.filter)
                    .expect("merge parts ordered by construction");
                ProcessingQueue::new(state)
            })
            .collect();

        for (key, task) in a.outstanding.into_iter().chain(b.outstanding) {
            let home = merged
                .iter_mut()
                .find(|queue| queue.state.contains(key))
                .expect("merge parts cover both input ranges");
            debug_assert!(
                home.state.domain_filter().matches(task.domain_id()),
                "merged filter must own every input task"
            );
            home.outstanding.insert(key, task);
        }

        merged
    }
}

impl core::fmt::Debug for ProcessingQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessingQueue")
            .field("state", &self.state)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}
