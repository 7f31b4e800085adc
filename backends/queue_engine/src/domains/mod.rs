// Domain ownership metadata and the filter algebra processing queues
// use to claim subsets of the task stream.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time;

use serde::{Deserialize, Serialize};

/// [`DomainFilter`] decides which domains a processing queue owns.
///
/// `reverse_match = false` reads as "exactly these domains";
/// `reverse_match = true` reads as "everything except these domains".
/// The broadest possible filter is therefore an empty exclusion set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFilter {
    domain_ids: BTreeSet<String>,
    reverse_match: bool,
}

// --- constructors

impl DomainFilter {
    /// Filter matching exactly the given domains.
    #[must_use]
    pub fn including<I, S>(domain_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain_ids: domain_ids.into_iter().map(Into::into).collect(),
            reverse_match: false,
        }
    }

    /// Filter matching everything but the given domains.
    #[must_use]
    pub fn excluding<I, S>(domain_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain_ids: domain_ids.into_iter().map(Into::into).collect(),
            reverse_match: true,
        }
    }

    /// The broadest filter: matches every domain.
    #[must_use]
    pub fn all() -> Self {
        Self::excluding(Vec::<String>::new())
    }

    #[must_use]
    pub fn from_parts(domain_ids: BTreeSet<String>, reverse_match: bool) -> Self {
        Self {
            domain_ids,
            reverse_match,
        }
    }
}

// --- methods

impl DomainFilter {
    #[must_use]
    pub fn matches(&self, domain_id: &str) -> bool {
        self.domain_ids.contains(domain_id) ^ self.reverse_match
    }

    #[must_use]
    pub fn domain_ids(&self) -> &BTreeSet<String> {
        &self.domain_ids
    }

    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.reverse_match
    }

    /// Merges two filters so the result owns every domain either input
    /// owned. If either side is an exclusion filter the result stays an
    /// exclusion filter over the intersection of the sets; otherwise it
    /// is the plain union. Associative, commutative and idempotent.
    #[must_use]
    pub fn merge(&self, other: &DomainFilter) -> DomainFilter {
        if self.reverse_match || other.reverse_match {
            let excluded = match (self.reverse_match, other.reverse_match) {
                (true, true) => self
                    .domain_ids
                    .intersection(&other.domain_ids)
                    .cloned()
                    .collect(),
                // one side lists exclusions, the other inclusions: the
                // merged filter only keeps excluding what the inclusion
                // side does not explicitly claim.
                (true, false) => self
                    .domain_ids
                    .difference(&other.domain_ids)
                    .cloned()
                    .collect(),
                (false, true) => other
                    .domain_ids
                    .difference(&self.domain_ids)
                    .cloned()
                    .collect(),
                (false, false) => unreachable!(),
            };
            DomainFilter {
                domain_ids: excluded,
                reverse_match: true,
            }
        } else {
            DomainFilter {
                domain_ids: self.domain_ids.union(&other.domain_ids).cloned().collect(),
                reverse_match: false,
            }
        }
    }

    /// True when every domain `other` matches is also matched by
    /// `self`, so `other` claims no ownership `self` does not hold.
    #[must_use]
    pub fn covers(&self, other: &DomainFilter) -> bool {
        match (self.reverse_match, other.reverse_match) {
            (false, false) => other.domain_ids.is_subset(&self.domain_ids),
            // an exclusion filter matches unboundedly many domains;
            // a finite inclusion list never contains that
            (false, true) => false,
            (true, false) => other.domain_ids.is_disjoint(&self.domain_ids),
            (true, true) => self.domain_ids.is_subset(&other.domain_ids),
        }
    }

    /// Returns a copy of this filter that no longer owns the given
    /// domain. Used when a split policy carves a domain out of a queue.
    #[must_use]
    pub fn without(&self, domain_id: &str) -> DomainFilter {
        let mut next = self.clone();
        if next.reverse_match {
            next.domain_ids.insert(domain_id.to_string());
        } else {
            next.domain_ids.remove(domain_id);
        }
        next
    }
}

/// Ownership metadata for one domain as the engine needs it: which
/// cluster drives the domain and whether failover is mid-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainOwnership {
    pub active_cluster: String,
    pub failover_version: i64,
    pub is_global: bool,
    pub pending_active: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("domain {0} is not registered")]
    NotFound(String),

    #[error("domain directory unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator answering domain ownership questions. The
/// engine only reads; registration and cache refresh live with the
/// host.
pub trait DomainDirectory: Send + Sync {
    fn ownership(&self, domain_id: &str) -> Result<DomainOwnership, DomainError>;

    /// How often the host refreshes its ownership cache. Consumed by
    /// the not-active retry rule: a task older than twice this window
    /// is completed rather than retried.
    fn refresh_interval(&self) -> time::Duration;
}

/// In-memory [`DomainDirectory`] used by tests and demos.
pub struct StaticDomainDirectory {
    entries: RwLock<HashMap<String, DomainOwnership>>,
    refresh_interval: time::Duration,
}

impl StaticDomainDirectory {
    #[must_use]
    pub fn new(refresh_interval: time::Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh_interval,
        }
    }

    pub fn register(&self, domain_id: impl Into<String>, ownership: DomainOwnership) {
        self.entries
            .write()
            .expect("domain directory lock poisoned")
            .insert(domain_id.into(), ownership);
    }
}

impl DomainDirectory for StaticDomainDirectory {
    fn ownership(&self, domain_id: &str) -> Result<DomainOwnership, DomainError> {
        self.entries
            .read()
            .expect("domain directory lock poisoned")
            .get(domain_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(domain_id.to_string()))
    }

    fn refresh_interval(&self) -> time::Duration {
        self.refresh_interval
    }
}
