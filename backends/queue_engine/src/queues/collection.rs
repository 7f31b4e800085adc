// All processing queues sharing one level. The collection keeps its
// queues sorted and disjoint; only the first unfinished queue hands
// tasks to the poller.

use std::sync::Arc;

use crate::keys::TaskKey;
use crate::tasks::QueueTask;

use super::queue::ProcessingQueue;
use super::split::SplitPolicy;
use super::state::{QueueError, QueueState};

pub struct QueueCollection {
    level: usize,
    queues: Vec<ProcessingQueue>,
}

// --- constructors

impl QueueCollection {
    #[must_use]
    pub fn new(level: usize, queues: Vec<ProcessingQueue>) -> Self {
        let mut collection = Self {
            level,
            queues: Vec::new(),
        };
        for queue in queues {
            collection.absorb(queue);
        }
        collection
    }
}

// --- methods

impl QueueCollection {
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn states(&self) -> Vec<QueueState> {
        self.queues.iter().map(|q| q.state().clone()).collect()
    }

    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.queues
            .iter()
            .map(ProcessingQueue::outstanding_count)
            .sum()
    }

    /// The single queue new tasks are read into: the lowest-acked
    /// queue whose range is not exhausted.
    #[must_use]
    pub fn active_queue(&self) -> Option<&ProcessingQueue> {
        self.queues.iter().find(|q| !q.state().is_exhausted())
    }

    pub fn active_queue_mut(&mut self) -> Option<&mut ProcessingQueue> {
        self.queues.iter_mut().find(|q| !q.state().is_exhausted())
    }

    /// Inserts read tasks into the active queue.
    pub fn add_tasks_to_active(
        &mut self,
        tasks: Vec<Arc<QueueTask>>,
        new_read_level: TaskKey,
    ) -> Result<usize, QueueError> {
        let active = self.active_queue_mut().ok_or_else(|| {
            QueueError::InvalidState("collection has no active queue left".to_string())
        })?;
        active.add_tasks(tasks, new_read_level)
    }

    /// Adds a queue, merging it with any overlapping neighbor so the
    /// collection's ranges stay disjoint.
    pub fn absorb(&mut self, queue: ProcessingQueue) {
        debug_assert_eq!(queue.state().level(), self.level, "level mismatch on absorb");

        let mut incoming = vec![queue];
        while let Some(next) = incoming.pop() {
            match self
                .queues
                .iter()
                .position(|q| q.state().overlaps(next.state()))
            {
                None => self.queues.push(next),
                Some(index) => {
                    let existing = self.queues.swap_remove(index);
                    // merge may fan out into disjoint parts; feed them
                    // back until everything has a home
                    incoming.extend(existing.merge(next));
                }
            }
        }
        self.queues
            .sort_by(|a, b| a.state().ack_level().cmp(&b.state().ack_level()));
    }

    /// Sweeps every queue's ack level, dropping queues that drained
    /// completely. Returns the minimum ack level still owned, or
    /// `None` once the collection has no queues left.
    pub fn update_ack_levels(&mut self) -> Option<TaskKey> {
        for queue in &mut self.queues {
            let _ = queue.update_ack_level();
        }
        self.queues.retain(|queue| {
            let drained = queue.is_drained();
            if drained {
                tracing::debug!(
                    level = queue.state().level(),
                    ack = %queue.state().ack_level(),
                    "processing queue drained, destroying"
                );
            }
            !drained
        });
        self.queues
            .iter()
            .map(|q| q.state().ack_level())
            .min()
    }

    /// Runs the split policy over every queue. Same-level results are
    /// re-absorbed; queues promoted to other levels are returned for
    /// the processor to re-home.
    #[must_use]
    pub fn split(&mut self, policy: &dyn SplitPolicy) -> Vec<ProcessingQueue> {
        let queues = std::mem::take(&mut self.queues);
        let mut emigrants = Vec::new();
        for queue in queues {
            for piece in queue.split(policy) {
                if piece.state().level() == self.level {
                    self.absorb(piece);
                } else {
                    emigrants.push(piece);
                }
            }
        }
        emigrants
    }

    /// Every task the allocator could not give a verdict for yet;
    /// the processor re-checks these before each ack sweep.
    #[must_use]
    pub fn unfiltered_tasks(&self) -> Vec<Arc<QueueTask>> {
        self.queues
            .iter()
            .flat_map(|queue| queue.outstanding().values())
            .filter(|task| task.should_process().is_none())
            .cloned()
            .collect()
    }
}

impl core::fmt::Debug for QueueCollection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueCollection")
            .field("level", &self.level)
            .field("queues", &self.queues.len())
            .finish()
    }
}
