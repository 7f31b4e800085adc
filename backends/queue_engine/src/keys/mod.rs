// Implements the total order over task keys shared by both durable
// streams a shard owns.

use core::cmp;

use chrono::{DateTime, Utc};
use derive_more::derive::Display;
use serde::{Deserialize, Serialize};

/// The two durable streams a shard owns. Every engine instance is
/// bound to exactly one kind for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum QueueKind {
    #[display("transfer")]
    Transfer,

    #[display("timer")]
    Timer,
}

/// [`TaskKey`] totally orders tasks within one stream.
///
/// Transfer keys are plain monotonic integers. Timer keys order by
/// visibility timestamp first and fall back to the task id only to
/// break ties between equally-timestamped tasks.
///
/// Keys of different streams never meet: an engine instance works a
/// single [`QueueKind`], so a cross-kind comparison is an invariant
/// breach and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum TaskKey {
    #[display("transfer({_0})")]
    Transfer(i64),

    #[display("timer({visibility}, {task_id})")]
    Timer {
        visibility: DateTime<Utc>,
        task_id: i64,
    },
}

// --- constructors

impl TaskKey {
    #[must_use]
    pub fn transfer(task_id: i64) -> Self {
        TaskKey::Transfer(task_id)
    }

    #[must_use]
    pub fn timer(visibility: DateTime<Utc>, task_id: i64) -> Self {
        TaskKey::Timer {
            visibility,
            task_id,
        }
    }

    /// Smallest key of the given stream, usable as an open lower bound
    /// that every real task key lies above.
    #[must_use]
    pub fn min_sentinel(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Transfer => TaskKey::Transfer(0),
            QueueKind::Timer => TaskKey::Timer {
                visibility: DateTime::<Utc>::UNIX_EPOCH,
                task_id: 0,
            },
        }
    }

    /// Largest key of the given stream, denoting "unbounded above".
    #[must_use]
    pub fn max_sentinel(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Transfer => TaskKey::Transfer(i64::MAX),
            QueueKind::Timer => TaskKey::Timer {
                visibility: DateTime::<Utc>::MAX_UTC,
                task_id: i64::MAX,
            },
        }
    }
}

// --- methods

impl TaskKey {
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        match self {
            TaskKey::Transfer(_) => QueueKind::Transfer,
            TaskKey::Timer { .. } => QueueKind::Timer,
        }
    }

    #[must_use]
    pub fn is_max_sentinel(&self) -> bool {
        *self == Self::max_sentinel(self.kind())
    }

    /// Smallest key strictly above this one: `+1` for transfer keys,
    /// `+1ms` on the timestamp (tiebreaker reset) for timer keys.
    #[must_use]
    pub fn next_tick(&self) -> Self {
        match self {
            TaskKey::Transfer(id) => TaskKey::Transfer(id.saturating_add(1)),
            TaskKey::Timer { visibility, .. } => TaskKey::Timer {
                visibility: visibility
                    .checked_add_signed(chrono::Duration::milliseconds(1))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                task_id: 0,
            },
        }
    }

    /// Completion boundaries for timer queues align on timestamp
    /// edges: the tiebreaker collapses to zero. Transfer keys are
    /// already normal.
    #[must_use]
    pub fn normalized(&self) -> Self {
        match self {
            TaskKey::Transfer(id) => TaskKey::Transfer(*id),
            TaskKey::Timer { visibility, .. } => TaskKey::Timer {
                visibility: *visibility,
                task_id: 0,
            },
        }
    }

    #[must_use]
    pub fn transfer_id(&self) -> Option<i64> {
        match self {
            TaskKey::Transfer(id) => Some(*id),
            TaskKey::Timer { .. } => None,
        }
    }

    #[must_use]
    pub fn visibility(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskKey::Transfer(_) => None,
            TaskKey::Timer { visibility, .. } => Some(*visibility),
        }
    }
}

impl Ord for TaskKey {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (self, other) {
            (TaskKey::Transfer(me), TaskKey::Transfer(them)) => me.cmp(them),
            (
                TaskKey::Timer {
                    visibility: me_ts,
                    task_id: me_id,
                },
                TaskKey::Timer {
                    visibility: them_ts,
                    task_id: them_id,
                },
            ) => me_ts.cmp(them_ts).then(me_id.cmp(them_id)),
            _ => panic!("task keys of different streams are not comparable"),
        }
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
