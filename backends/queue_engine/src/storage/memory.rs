// In-memory shard storage backing tests and demos. Behaves like the
// real thing for the engine's purposes: ordered task rows, paged
// reads, range deletes, progress records, and a closable shard.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use chrono::Utc;

use crate::keys::{QueueKind, TaskKey};
use crate::tasks::TaskInfo;

use super::{
    FailoverLevel, PageToken, PersistedQueueState, ShardStorage, StorageError, TaskPage,
};

#[derive(Default)]
struct StreamData {
    tasks: BTreeMap<TaskKey, TaskInfo>,
    cluster_acks: HashMap<String, TaskKey>,
    queue_states: HashMap<String, Vec<PersistedQueueState>>,
    completed: Option<TaskKey>,
    failover: HashMap<String, FailoverLevel>,
    high_water: Option<TaskKey>,
    max_read_override: Option<TaskKey>,
}

pub struct MemoryShardStorage {
    transfer: Mutex<StreamData>,
    timer: Mutex<StreamData>,
    closed: crate::wakeups::Toggle,
}

// --- constructors

impl Default for MemoryShardStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryShardStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            transfer: Mutex::new(StreamData::default()),
            timer: Mutex::new(StreamData::default()),
            closed: crate::wakeups::Toggle::new(),
        }
    }
}

// --- methods

impl MemoryShardStorage {
    fn stream(&self, kind: QueueKind) -> std::sync::MutexGuard<'_, StreamData> {
        match kind {
            QueueKind::Transfer => self.transfer.lock().expect("storage lock poisoned"),
            QueueKind::Timer => self.timer.lock().expect("storage lock poisoned"),
        }
    }

    fn guard(&self) -> Result<(), StorageError> {
        if self.closed.probe() {
            return Err(StorageError::ShardClosed);
        }
        Ok(())
    }

    /// Appends one task row and advances the stream's high-water mark.
    pub fn add_task(&self, info: TaskInfo) {
        let kind = info.kind();
        let mut stream = self.stream(kind);
        let key = info.key;
        stream.tasks.insert(key, info);
        stream.high_water = Some(match stream.high_water {
            Some(existing) if existing >= key => existing,
            _ => key,
        });
    }

    /// Pins the reported max read level; tests use this to model a
    /// shard whose read horizon trails the stored tasks.
    pub fn set_max_read_level(&self, kind: QueueKind, level: TaskKey) {
        self.stream(kind).max_read_override = Some(level);
    }

    /// Marks the shard as moved away; every subsequent call fails
    /// with [`StorageError::ShardClosed`].
    pub fn close_shard(&self) {
        self.closed.turn_on();
    }

    #[must_use]
    pub fn remaining_tasks(&self, kind: QueueKind) -> usize {
        self.stream(kind).tasks.len()
    }
}

fn encode_token(key: TaskKey) -> PageToken {
    serde_json::to_vec(&key).expect("task key encodes")
}

fn decode_token(token: &[u8]) -> Result<TaskKey, StorageError> {
    serde_json::from_slice(token)
        .map_err(|err| StorageError::Corrupted(format!("bad page token: {err}")))
}

impl ShardStorage for MemoryShardStorage {
    fn get_tasks(
        &self,
        kind: QueueKind,
        read_level: TaskKey,
        max_read_level: TaskKey,
        batch_size: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, StorageError> {
        self.guard()?;

        let resume_after = match page {
            Some(token) => decode_token(&token)?,
            None => read_level,
        };

        let batch_size = batch_size.max(1);
        let stream = self.stream(kind);
        let rows = stream
            .tasks
            .range((Bound::Excluded(resume_after), Bound::Included(max_read_level)));

        let mut tasks: Vec<TaskInfo> = Vec::with_capacity(batch_size);
        let mut next_page = None;
        for (_, info) in rows {
            if tasks.len() == batch_size {
                // one row past the batch proves the range has more
                next_page = Some(encode_token(tasks.last().expect("batch not empty").key));
                break;
            }
            tasks.push(info.clone());
        }

        Ok(TaskPage { tasks, next_page })
    }

    fn range_complete(
        &self,
        kind: QueueKind,
        begin: TaskKey,
        end: TaskKey,
    ) -> Result<usize, StorageError> {
        self.guard()?;

        let mut stream = self.stream(kind);
        let doomed: Vec<TaskKey> = match kind {
            // transfer deletes (begin, end] on task ids
            QueueKind::Transfer => stream
                .tasks
                .range((Bound::Excluded(begin), Bound::Included(end)))
                .map(|(key, _)| *key)
                .collect(),
            // timer deletes [begin, end) on visibility timestamps
            QueueKind::Timer => stream
                .tasks
                .range((Bound::Included(begin.normalized()), Bound::Unbounded))
                .take_while(|(key, _)| key.normalized() < end.normalized())
                .map(|(key, _)| *key)
                .collect(),
        };

        for key in &doomed {
            stream.tasks.remove(key);
        }
        Ok(doomed.len())
    }

    fn cluster_ack_level(&self, kind: QueueKind, cluster: &str) -> Result<TaskKey, StorageError> {
        self.guard()?;
        Ok(self
            .stream(kind)
            .cluster_acks
            .get(cluster)
            .copied()
            .unwrap_or_else(|| TaskKey::min_sentinel(kind)))
    }

    fn set_cluster_ack_level(
        &self,
        kind: QueueKind,
        cluster: &str,
        ack_level: TaskKey,
    ) -> Result<(), StorageError> {
        self.guard()?;
        self.stream(kind)
            .cluster_acks
            .insert(cluster.to_string(), ack_level);
        Ok(())
    }

    fn all_cluster_ack_levels(
        &self,
        kind: QueueKind,
    ) -> Result<HashMap<String, TaskKey>, StorageError> {
        self.guard()?;
        Ok(self.stream(kind).cluster_acks.clone())
    }

    fn queue_states(
        &self,
        kind: QueueKind,
        cluster: &str,
    ) -> Result<Option<Vec<PersistedQueueState>>, StorageError> {
        self.guard()?;
        Ok(self.stream(kind).queue_states.get(cluster).cloned())
    }

    fn set_queue_states(
        &self,
        kind: QueueKind,
        cluster: &str,
        states: Vec<PersistedQueueState>,
    ) -> Result<(), StorageError> {
        self.guard()?;
        self.stream(kind)
            .queue_states
            .insert(cluster.to_string(), states);
        Ok(())
    }

    fn completed_level(&self, kind: QueueKind) -> Result<TaskKey, StorageError> {
        self.guard()?;
        Ok(self
            .stream(kind)
            .completed
            .unwrap_or_else(|| TaskKey::min_sentinel(kind)))
    }

    fn set_completed_level(&self, kind: QueueKind, level: TaskKey) -> Result<(), StorageError> {
        self.guard()?;
        self.stream(kind).completed = Some(level);
        Ok(())
    }

    fn failover_levels(
        &self,
        kind: QueueKind,
    ) -> Result<HashMap<String, FailoverLevel>, StorageError> {
        self.guard()?;
        Ok(self.stream(kind).failover.clone())
    }

    fn set_failover_level(
        &self,
        kind: QueueKind,
        failover_id: &str,
        level: FailoverLevel,
    ) -> Result<(), StorageError> {
        self.guard()?;
        self.stream(kind)
            .failover
            .insert(failover_id.to_string(), level);
        Ok(())
    }

    fn delete_failover_level(
        &self,
        kind: QueueKind,
        failover_id: &str,
    ) -> Result<(), StorageError> {
        self.guard()?;
        self.stream(kind).failover.remove(failover_id);
        Ok(())
    }

    fn max_read_level(&self, kind: QueueKind) -> TaskKey {
        let stream = self.stream(kind);
        if let Some(level) = stream.max_read_override {
            return level;
        }
        match kind {
            QueueKind::Transfer => stream
                .high_water
                .unwrap_or_else(|| TaskKey::min_sentinel(kind)),
            // the timer horizon follows the clock: a timer becomes
            // readable the moment it is due
            QueueKind::Timer => TaskKey::timer(Utc::now(), 0),
        }
    }
}
