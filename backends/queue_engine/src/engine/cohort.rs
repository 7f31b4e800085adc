// Processor cohorts: the three behaviors a processor loop can wear.
// Active works locally-owned domains, standby mirrors a remote
// cluster, failover sweeps a fixed historical range once. Everything
// else about the loop is shared.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::allocator::{AllocatorError, TaskAllocator};
use crate::domains::DomainFilter;
use crate::keys::{QueueKind, TaskKey};
use crate::queues::{QueueError, QueueState};
use crate::storage::{FailoverLevel, PersistedQueueState, ShardStorage, StorageError};
use crate::tasks::TaskInfo;

/// The cohort-specific surface a [`super::ProcessorBase`] loop needs:
/// where reads stop, where progress is persisted, which tasks are
/// ours, and what draining completely means.
pub trait ProcessorCohort: Send + Sync {
    fn label(&self) -> String;

    /// Upper bound for the next read; re-evaluated before every poll.
    fn max_read_level(&self) -> TaskKey;

    /// Legacy persistence path: a single ack watermark.
    fn persist_ack_level(&self, ack_level: TaskKey) -> Result<(), StorageError>;

    /// Preferred persistence path: the full queue-state list.
    fn persist_queue_states(&self, states: Vec<PersistedQueueState>)
        -> Result<(), StorageError>;

    /// Queue states to start from, honoring persisted state when the
    /// caller asks for it.
    fn initial_states(&self, load_persisted: bool) -> Result<Vec<QueueState>, StorageError>;

    fn task_filter(&self, info: &TaskInfo) -> Result<bool, AllocatorError>;

    /// Called once when every collection drained; failover cohorts
    /// retire their shard record here.
    fn queue_shutdown(&self) -> Result<(), StorageError>;

    fn allows_reset(&self) -> bool {
        true
    }
}

/// Builds the starting queue set for a cluster-owned cohort: reload
/// the persisted queue states when they still cover everything above
/// the cluster ack level, otherwise one full-range level-0 queue.
fn cluster_initial_states(
    kind: QueueKind,
    cluster: &str,
    storage: &dyn ShardStorage,
    load_persisted: bool,
) -> Result<Vec<QueueState>, StorageError> {
    let ack_level = storage.cluster_ack_level(kind, cluster)?;
    let fallback = || -> Result<Vec<QueueState>, StorageError> {
        let state = QueueState::new(
            0,
            ack_level,
            ack_level,
            TaskKey::max_sentinel(kind),
            DomainFilter::all(),
        )
        .map_err(|err: QueueError| StorageError::Corrupted(err.to_string()))?;
        Ok(vec![state])
    };

    if !load_persisted {
        return fallback();
    }
    let Some(persisted) = storage.queue_states(kind, cluster)? else {
        return fallback();
    };

    let mut states = Vec::with_capacity(persisted.len());
    for record in &persisted {
        match QueueState::from_persisted(record) {
            Ok(state) => states.push(state),
            Err(err) => {
                tracing::warn!(error = %err, "persisted queue state invalid, falling back");
                return fallback();
            }
        }
    }

    // the union of ranges must cover everything above the cluster ack
    // level, or progress would silently vanish
    states.sort_by(|a, b| a.ack_level().cmp(&b.ack_level()));
    let mut covered = ack_level;
    for state in &states {
        if state.ack_level() > covered {
            tracing::warn!(
                gap_from = %covered,
                gap_to = %state.ack_level(),
                "persisted queue states leave a gap, falling back"
            );
            return fallback();
        }
        covered = covered.max(state.max_level());
    }
    if covered < TaskKey::max_sentinel(kind) {
        tracing::warn!(covered = %covered, "persisted queue states truncated, falling back");
        return fallback();
    }

    Ok(states)
}

/// Cohort processing domains this cluster actively owns.
pub struct ActiveCohort {
    kind: QueueKind,
    cluster: String,
    storage: Arc<dyn ShardStorage>,
    allocator: Arc<TaskAllocator>,
}

impl ActiveCohort {
    #[must_use]
    pub fn new(
        kind: QueueKind,
        cluster: impl Into<String>,
        storage: Arc<dyn ShardStorage>,
        allocator: Arc<TaskAllocator>,
    ) -> Self {
        Self {
            kind,
            cluster: cluster.into(),
            storage,
            allocator,
        }
    }
}

impl ProcessorCohort for ActiveCohort {
    fn label(&self) -> String {
        format!("active-{}", self.cluster)
    }

    fn max_read_level(&self) -> TaskKey {
        self.storage.max_read_level(self.kind)
    }

    fn persist_ack_level(&self, ack_level: TaskKey) -> Result<(), StorageError> {
        self.storage
            .set_cluster_ack_level(self.kind, &self.cluster, ack_level)
    }

    fn persist_queue_states(
        &self,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        self.storage
            .set_queue_states(self.kind, &self.cluster, states)
    }

    fn initial_states(&self, load_persisted: bool) -> Result<Vec<QueueState>, StorageError> {
        cluster_initial_states(self.kind, &self.cluster, self.storage.as_ref(), load_persisted)
    }

    fn task_filter(&self, info: &TaskInfo) -> Result<bool, AllocatorError> {
        self.allocator.verify_active(&info.domain_id)
    }

    fn queue_shutdown(&self) -> Result<(), StorageError> {
        tracing::debug!(label = self.label(), "active processor drained");
        Ok(())
    }
}

/// Cohort mirroring progress of domains a remote cluster owns.
pub struct StandbyCohort {
    kind: QueueKind,
    remote_cluster: String,
    storage: Arc<dyn ShardStorage>,
    allocator: Arc<TaskAllocator>,
}

impl StandbyCohort {
    #[must_use]
    pub fn new(
        kind: QueueKind,
        remote_cluster: impl Into<String>,
        storage: Arc<dyn ShardStorage>,
        allocator: Arc<TaskAllocator>,
    ) -> Self {
        Self {
            kind,
            remote_cluster: remote_cluster.into(),
            storage,
            allocator,
        }
    }
}

impl ProcessorCohort for StandbyCohort {
    fn label(&self) -> String {
        format!("standby-{}", self.remote_cluster)
    }

    fn max_read_level(&self) -> TaskKey {
        self.storage.max_read_level(self.kind)
    }

    fn persist_ack_level(&self, ack_level: TaskKey) -> Result<(), StorageError> {
        self.storage
            .set_cluster_ack_level(self.kind, &self.remote_cluster, ack_level)
    }

    fn persist_queue_states(
        &self,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        self.storage
            .set_queue_states(self.kind, &self.remote_cluster, states)
    }

    fn initial_states(&self, load_persisted: bool) -> Result<Vec<QueueState>, StorageError> {
        cluster_initial_states(
            self.kind,
            &self.remote_cluster,
            self.storage.as_ref(),
            load_persisted,
        )
    }

    fn task_filter(&self, info: &TaskInfo) -> Result<bool, AllocatorError> {
        self.allocator
            .verify_standby(&self.remote_cluster, &info.domain_id)
    }

    fn queue_shutdown(&self) -> Result<(), StorageError> {
        tracing::debug!(label = self.label(), "standby processor drained");
        Ok(())
    }
}

/// Transient cohort sweeping `(min_level, max_level]` once for a set
/// of domains whose ownership just moved here.
pub struct FailoverCohort {
    kind: QueueKind,
    failover_id: String,
    domain_ids: BTreeSet<String>,
    min_level: TaskKey,
    max_level: TaskKey,
    started: DateTime<Utc>,
    storage: Arc<dyn ShardStorage>,
    allocator: Arc<TaskAllocator>,
}

impl FailoverCohort {
    #[must_use]
    pub fn new(
        kind: QueueKind,
        failover_id: impl Into<String>,
        domain_ids: BTreeSet<String>,
        min_level: TaskKey,
        max_level: TaskKey,
        started: DateTime<Utc>,
        storage: Arc<dyn ShardStorage>,
        allocator: Arc<TaskAllocator>,
    ) -> Self {
        Self {
            kind,
            failover_id: failover_id.into(),
            domain_ids,
            min_level,
            max_level,
            started,
            storage,
            allocator,
        }
    }

    fn level_record(&self, ack_level: TaskKey) -> FailoverLevel {
        FailoverLevel {
            ack_level,
            min_level: self.min_level,
            max_level: self.max_level,
            domain_ids: self.domain_ids.clone(),
            started: self.started,
        }
    }
}

impl ProcessorCohort for FailoverCohort {
    fn label(&self) -> String {
        format!("failover-{}", self.failover_id)
    }

    fn max_read_level(&self) -> TaskKey {
        // the sweep never chases the live stream
        self.max_level
    }

    fn persist_ack_level(&self, ack_level: TaskKey) -> Result<(), StorageError> {
        self.storage
            .set_failover_level(self.kind, &self.failover_id, self.level_record(ack_level))
    }

    fn persist_queue_states(
        &self,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        // failover records only carry a watermark
        let min_ack = states.iter().map(|s| s.ack_level).min();
        match min_ack {
            Some(ack) => self.persist_ack_level(ack),
            None => Ok(()),
        }
    }

    fn initial_states(&self, _load_persisted: bool) -> Result<Vec<QueueState>, StorageError> {
        let state = QueueState::new(
            0,
            self.min_level,
            self.min_level,
            self.max_level,
            DomainFilter::including(self.domain_ids.iter().cloned()),
        )
        .map_err(|err| StorageError::Corrupted(err.to_string()))?;
        Ok(vec![state])
    }

    fn task_filter(&self, info: &TaskInfo) -> Result<bool, AllocatorError> {
        self.allocator
            .verify_failover_active(&self.domain_ids, &info.domain_id)
    }

    fn queue_shutdown(&self) -> Result<(), StorageError> {
        tracing::info!(
            failover_id = self.failover_id,
            "failover sweep finished, deleting record"
        );
        self.storage
            .delete_failover_level(self.kind, &self.failover_id)
    }

    fn allows_reset(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test_cohorts {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::domains::StaticDomainDirectory;
    use crate::storage::MemoryShardStorage;

    fn allocator() -> Arc<TaskAllocator> {
        Arc::new(TaskAllocator::new(
            "local",
            Arc::new(StaticDomainDirectory::new(Duration::from_secs(10))),
        ))
    }

    fn persisted(level: usize, ack: i64, max: i64) -> PersistedQueueState {
        PersistedQueueState {
            level,
            ack_level: TaskKey::transfer(ack),
            read_level: TaskKey::transfer(ack),
            max_level: TaskKey::transfer(max),
            domain_ids: Vec::new(),
            reverse_match: true,
        }
    }

    #[test]
    fn initial_states_fall_back_to_full_range() {
        let storage = Arc::new(MemoryShardStorage::new());
        storage
            .set_cluster_ack_level(QueueKind::Transfer, "local", TaskKey::transfer(42))
            .expect("should persist");

        let cohort = ActiveCohort::new(
            QueueKind::Transfer,
            "local",
            storage.clone(),
            allocator(),
        );
        let states = cohort.initial_states(true).expect("should load");

        assert_eq!(states.len(), 1);
        assert_eq!(states[0].ack_level(), TaskKey::transfer(42));
        assert_eq!(
            states[0].max_level(),
            TaskKey::max_sentinel(QueueKind::Transfer)
        );
    }

    #[test]
    fn initial_states_reload_covering_persisted_set() {
        let storage = Arc::new(MemoryShardStorage::new());
        storage
            .set_cluster_ack_level(QueueKind::Transfer, "local", TaskKey::transfer(10))
            .expect("should persist");
        storage
            .set_queue_states(
                QueueKind::Transfer,
                "local",
                vec![persisted(0, 10, 500), persisted(1, 400, i64::MAX)],
            )
            .expect("should persist");

        let cohort = ActiveCohort::new(
            QueueKind::Transfer,
            "local",
            storage.clone(),
            allocator(),
        );
        let states = cohort.initial_states(true).expect("should load");

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].read_level(), states[0].ack_level());
    }

    #[test]
    fn gappy_persisted_states_are_discarded() {
        let storage = Arc::new(MemoryShardStorage::new());
        storage
            .set_cluster_ack_level(QueueKind::Transfer, "local", TaskKey::transfer(10))
            .expect("should persist");
        // hole between 200 and 400
        storage
            .set_queue_states(
                QueueKind::Transfer,
                "local",
                vec![persisted(0, 10, 200), persisted(1, 400, i64::MAX)],
            )
            .expect("should persist");

        let cohort = ActiveCohort::new(
            QueueKind::Transfer,
            "local",
            storage.clone(),
            allocator(),
        );
        let states = cohort.initial_states(true).expect("should load");

        assert_eq!(states.len(), 1);
        assert_eq!(states[0].ack_level(), TaskKey::transfer(10));
    }

    #[test]
    fn failover_cohort_retires_its_record_on_drain() {
        let storage = Arc::new(MemoryShardStorage::new());
        let domains: BTreeSet<String> = ["d1".to_string()].into();
        let cohort = FailoverCohort::new(
            QueueKind::Transfer,
            "fo-1",
            domains,
            TaskKey::transfer(0),
            TaskKey::transfer(100),
            Utc::now(),
            storage.clone(),
            allocator(),
        );

        cohort
            .persist_ack_level(TaskKey::transfer(50))
            .expect("should persist");
        assert_eq!(
            storage
                .failover_levels(QueueKind::Transfer)
                .expect("should read")
                .len(),
            1
        );

        cohort.queue_shutdown().expect("should delete");
        assert!(storage
            .failover_levels(QueueKind::Transfer)
            .expect("should read")
            .is_empty());
        assert!(!cohort.allows_reset());
    }
}
