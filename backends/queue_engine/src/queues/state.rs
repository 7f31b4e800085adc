// Processing queue state: one half-open key range at one level with
// a domain filter. Published values are immutable; progress happens
// by replacing the state inside the owning queue.

use crate::domains::DomainFilter;
use crate::keys::TaskKey;
use crate::storage::PersistedQueueState;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue state invalid: {0}")]
    InvalidState(String),

    #[error("task {key} outside queue range ({ack_level}, {max_level}]")]
    TaskOutOfRange {
        key: TaskKey,
        ack_level: TaskKey,
        max_level: TaskKey,
    },

    #[error("task {key} of domain {domain_id} not owned by queue filter")]
    TaskNotOwned { key: TaskKey, domain_id: String },

    #[error("read level may not regress from {current} to {proposed}")]
    ReadLevelRegressed {
        current: TaskKey,
        proposed: TaskKey,
    },
}

/// One processing queue's published state. The queue owns the
/// half-open range `(ack_level, max_level]` restricted to domains the
/// filter matches; `read_level` marks how far tasks were fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    level: usize,
    ack_level: TaskKey,
    read_level: TaskKey,
    max_level: TaskKey,
    domain_filter: DomainFilter,
}

// --- constructors

impl QueueState {
    /// Builds a state, validating `ack_level <= read_level <=
    /// max_level`.
    pub fn new(
        level: usize,
        ack_level: TaskKey,
        read_level: TaskKey,
        max_level: TaskKey,
        domain_filter: DomainFilter,
    ) -> Result<Self, QueueError> {
        if ack_level > read_level || read_level > max_level {
            return Err(QueueError::InvalidState(format!(
                "levels out of order: ack={ack_level} read={read_level} max={max_level}"
            )));
        }
        Ok(Self {
            level,
            ack_level,
            read_level,
            max_level,
            domain_filter,
        })
    }

    /// A freshly loaded state starts reading from its ack level; any
    /// previously fetched tasks died with the old host.
    pub fn from_persisted(persisted: &PersistedQueueState) -> Result<Self, QueueError> {
        Self::new(
            persisted.level,
            persisted.ack_level,
            persisted.ack_level,
            persisted.max_level,
            DomainFilter::from_parts(
                persisted.domain_ids.iter().cloned().collect(),
                persisted.reverse_match,
            ),
        )
    }
}

// --- methods

impl QueueState {
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn ack_level(&self) -> TaskKey {
        self.ack_level
    }

    #[must_use]
    pub fn read_level(&self) -> TaskKey {
        self.read_level
    }

    #[must_use]
    pub fn max_level(&self) -> TaskKey {
        self.max_level
    }

    #[must_use]
    pub fn domain_filter(&self) -> &DomainFilter {
        &self.domain_filter
    }

    /// Whether the key falls inside `(ack_level, max_level]`.
    #[must_use]
    pub fn contains(&self, key: TaskKey) -> bool {
        self.ack_level < key && key <= self.max_level
    }

    #[must_use]
    pub fn overlaps(&self, other: &QueueState) -> bool {
        self.ack_level < other.max_level && other.ack_level < self.max_level
    }

    /// Range fully acked and nothing left to read.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.ack_level >= self.max_level
    }

    pub(crate) fn set_ack_level(&mut self, ack_level: TaskKey) {
        debug_assert!(ack_level >= self.ack_level, "ack level regressed");
        self.ack_level = ack_level;
        if self.read_level < ack_level {
            self.read_level = ack_level;
        }
    }

    pub(crate) fn set_read_level(&mut self, read_level: TaskKey) {
        self.read_level = read_level;
    }

    #[must_use]
    pub fn to_persisted(&self) -> PersistedQueueState {
        PersistedQueueState {
            level: self.level,
            ack_level: self.ack_level,
            read_level: self.read_level,
            max_level: self.max_level,
            domain_ids: self.domain_filter.domain_ids().iter().cloned().collect(),
            reverse_match: self.domain_filter.is_reverse(),
        }
    }
}
