// Live-reloadable engine tunables. Every option is a shared cell the
// host may rewrite at any time; loops read them fresh each tick.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;

/// [`Dyn`] is a shared, hot-swappable configuration value. Reads
/// clone the current value; writes apply to every holder at once.
pub struct Dyn<T>(Arc<RwLock<T>>);

impl<T> Clone for Dyn<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Dyn<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.0.read().expect("config cell lock poisoned").clone()
    }

    pub fn set(&self, value: T) {
        *self.0.write().expect("config cell lock poisoned") = value;
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Dyn<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Dyn({:?})",
            self.0.read().expect("config cell lock poisoned")
        )
    }
}

/// Per-level thresholds with a fallback for levels past the end of
/// the configured map.
#[derive(Debug, Clone)]
pub struct LevelThresholds {
    by_level: HashMap<usize, usize>,
    default: usize,
}

impl LevelThresholds {
    #[must_use]
    pub fn new(by_level: HashMap<usize, usize>, default: usize) -> Self {
        Self { by_level, default }
    }

    #[must_use]
    pub fn flat(default: usize) -> Self {
        Self {
            by_level: HashMap::new(),
            default,
        }
    }

    #[must_use]
    pub fn for_level(&self, level: usize) -> usize {
        self.by_level.get(&level).copied().unwrap_or(self.default)
    }
}

/// Per-domain durations with a fallback for domains the map does not
/// name.
#[derive(Debug, Clone)]
pub struct DomainDurations {
    by_domain: HashMap<String, Duration>,
    default: Duration,
}

impl DomainDurations {
    #[must_use]
    pub fn new(by_domain: HashMap<String, Duration>, default: Duration) -> Self {
        Self { by_domain, default }
    }

    #[must_use]
    pub fn flat(default: Duration) -> Self {
        Self {
            by_domain: HashMap::new(),
            default,
        }
    }

    #[must_use]
    pub fn for_domain(&self, domain_id: &str) -> Duration {
        self.by_domain
            .get(domain_id)
            .copied()
            .unwrap_or(self.default)
    }
}

/// All engine tunables. Field names follow the option table of the
/// engine contract; every one of them may change while running.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: Dyn<usize>,
    pub max_poll_rps: Dyn<u32>,
    pub max_poll_interval: Dyn<Duration>,
    pub max_poll_interval_jitter: Dyn<f64>,
    pub update_ack_interval: Dyn<Duration>,
    pub update_ack_interval_jitter: Dyn<f64>,
    pub redispatch_interval: Dyn<Duration>,
    pub redispatch_interval_jitter: Dyn<f64>,
    pub max_redispatch_queue_size: Dyn<usize>,
    pub split_queue_interval: Dyn<Duration>,
    pub split_queue_interval_jitter: Dyn<f64>,
    pub enable_split: Dyn<bool>,
    pub split_max_level: Dyn<usize>,
    pub pending_task_split_threshold: Dyn<LevelThresholds>,
    pub stuck_task_split_threshold: Dyn<LevelThresholds>,
    pub random_split_probability: Dyn<f64>,
    pub enable_random_split_by_domain: Dyn<bool>,
    pub split_look_ahead_duration_by_domain: Dyn<DomainDurations>,
    pub poll_backoff_interval: Dyn<Duration>,
    pub poll_backoff_interval_jitter: Dyn<f64>,
    pub enable_persist_queue_states: Dyn<bool>,
    pub enable_load_queue_states: Dyn<bool>,
    pub complete_interval: Dyn<Duration>,
    pub complete_interval_jitter: Dyn<f64>,
    pub complete_failure_retry_count: Dyn<u32>,
    pub max_task_retry_count: Dyn<u32>,
    // standby executor retry shape; carried here, consumed by the
    // executor collaborator
    pub standby_task_rereplication_timeout: Dyn<Duration>,
    pub standby_task_missing_events_resend_delay: Dyn<Duration>,
    pub standby_task_missing_events_discard_delay: Dyn<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: Dyn::new(100),
            max_poll_rps: Dyn::new(20),
            max_poll_interval: Dyn::new(Duration::from_secs(60)),
            max_poll_interval_jitter: Dyn::new(0.15),
            update_ack_interval: Dyn::new(Duration::from_secs(30)),
            update_ack_interval_jitter: Dyn::new(0.15),
            redispatch_interval: Dyn::new(Duration::from_secs(5)),
            redispatch_interval_jitter: Dyn::new(0.15),
            max_redispatch_queue_size: Dyn::new(10_000),
            split_queue_interval: Dyn::new(Duration::from_secs(60)),
            split_queue_interval_jitter: Dyn::new(0.15),
            enable_split: Dyn::new(false),
            split_max_level: Dyn::new(2),
            pending_task_split_threshold: Dyn::new(LevelThresholds::flat(1000)),
            stuck_task_split_threshold: Dyn::new(LevelThresholds::flat(100)),
            random_split_probability: Dyn::new(0.01),
            enable_random_split_by_domain: Dyn::new(false),
            split_look_ahead_duration_by_domain: Dyn::new(DomainDurations::flat(
                Duration::from_secs(20 * 60),
            )),
            poll_backoff_interval: Dyn::new(Duration::from_secs(5)),
            poll_backoff_interval_jitter: Dyn::new(0.15),
            enable_persist_queue_states: Dyn::new(true),
            enable_load_queue_states: Dyn::new(true),
            complete_interval: Dyn::new(Duration::from_secs(60)),
            complete_interval_jitter: Dyn::new(0.15),
            complete_failure_retry_count: Dyn::new(10),
            max_task_retry_count: Dyn::new(100),
            standby_task_rereplication_timeout: Dyn::new(Duration::from_secs(30)),
            standby_task_missing_events_resend_delay: Dyn::new(Duration::from_secs(15 * 60)),
            standby_task_missing_events_discard_delay: Dyn::new(Duration::from_secs(25 * 60)),
        }
    }
}

/// Applies a positive jitter of up to `coefficient` of the base
/// duration, spreading periodic work across processors.
pub fn jittered(base: Duration, coefficient: f64, rng: &mut impl Rng) -> Duration {
    if coefficient <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * coefficient * rng.random::<f64>();
    base + Duration::from_secs_f64(spread)
}
