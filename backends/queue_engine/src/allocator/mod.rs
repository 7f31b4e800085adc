// The task allocator answers whether this engine instance should
// process a given (domain, task) pair, and exposes the pause latch
// external failover machinery flips while ownership moves.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use crate::domains::{DomainDirectory, DomainError};

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// The ownership lookup itself failed; callers must treat the
    /// verdict as unknown and retry.
    #[error("domain ownership lookup failed: {0}")]
    Lookup(#[from] DomainError),
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    readers: usize,
}

/// Reader/writer latch: task-filter checks read, the external pause
/// writes. A pause waits out in-flight checks and holds new ones
/// until resumed.
struct PauseLatch {
    state: Mutex<PauseState>,
    event: Condvar,
}

impl PauseLatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(PauseState::default()),
            event: Condvar::new(),
        }
    }

    fn enter_read(&self) {
        let mut state = self.state.lock().expect("pause latch lock poisoned");
        while state.paused {
            state = self.event.wait(state).expect("pause latch lock poisoned");
        }
        state.readers += 1;
    }

    fn exit_read(&self) {
        let mut state = self.state.lock().expect("pause latch lock poisoned");
        state.readers -= 1;
        if state.readers == 0 {
            self.event.notify_all();
        }
    }

    fn pause(&self) {
        let mut state = self.state.lock().expect("pause latch lock poisoned");
        while state.paused {
            // a second pauser queues behind the first
            state = self.event.wait(state).expect("pause latch lock poisoned");
        }
        state.paused = true;
        while state.readers > 0 {
            state = self.event.wait(state).expect("pause latch lock poisoned");
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock().expect("pause latch lock poisoned");
        state.paused = false;
        drop(state);
        self.event.notify_all();
    }
}

pub struct TaskAllocator {
    current_cluster: String,
    directory: Arc<dyn DomainDirectory>,
    latch: PauseLatch,
}

// --- constructors

impl TaskAllocator {
    #[must_use]
    pub fn new(current_cluster: impl Into<String>, directory: Arc<dyn DomainDirectory>) -> Self {
        Self {
            current_cluster: current_cluster.into(),
            directory,
            latch: PauseLatch::new(),
        }
    }
}

// --- methods

impl TaskAllocator {
    #[must_use]
    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    /// Should the active processor execute a task of this domain?
    /// Local-only domains always process here; global domains only
    /// when this cluster owns them.
    pub fn verify_active(&self, domain_id: &str) -> Result<bool, AllocatorError> {
        self.latch.enter_read();
        let verdict = self.directory.ownership(domain_id).map(|ownership| {
            !ownership.is_global || ownership.active_cluster == self.current_cluster
        });
        self.latch.exit_read();
        Ok(verdict?)
    }

    /// Should the standby processor for `standby_cluster` track a
    /// task of this domain?
    pub fn verify_standby(
        &self,
        standby_cluster: &str,
        domain_id: &str,
    ) -> Result<bool, AllocatorError> {
        self.latch.enter_read();
        let verdict = self
            .directory
            .ownership(domain_id)
            .map(|ownership| ownership.is_global && ownership.active_cluster == standby_cluster);
        self.latch.exit_read();
        Ok(verdict?)
    }

    /// Should a failover sweep over `target_domains` execute a task
    /// of this domain? The target set was fixed when the sweep was
    /// minted; no directory consult needed.
    pub fn verify_failover_active(
        &self,
        target_domains: &BTreeSet<String>,
        domain_id: &str,
    ) -> Result<bool, AllocatorError> {
        self.latch.enter_read();
        let verdict = target_domains.contains(domain_id);
        self.latch.exit_read();
        Ok(verdict)
    }

    /// Holds all task-filter decisions until [`Self::resume_processing`].
    /// Used by failover callbacks while domain ownership flips.
    pub fn pause_processing(&self) {
        self.latch.pause();
    }

    pub fn resume_processing(&self) {
        self.latch.resume();
    }
}

#[cfg(test)]
mod test_task_allocator {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::TaskAllocator;
    use crate::domains::{DomainOwnership, StaticDomainDirectory};

    fn directory() -> Arc<StaticDomainDirectory> {
        let directory = StaticDomainDirectory::new(Duration::from_secs(10));
        directory.register(
            "global-here",
            DomainOwnership {
                active_cluster: "local".to_string(),
                failover_version: 1,
                is_global: true,
                pending_active: false,
            },
        );
        directory.register(
            "global-there",
            DomainOwnership {
                active_cluster: "remote".to_string(),
                failover_version: 1,
                is_global: true,
                pending_active: false,
            },
        );
        directory.register(
            "local-only",
            DomainOwnership {
                active_cluster: "local".to_string(),
                failover_version: 0,
                is_global: false,
                pending_active: false,
            },
        );
        Arc::new(directory)
    }

    #[test]
    fn active_verdicts_follow_ownership() {
        let allocator = TaskAllocator::new("local", directory());

        assert!(allocator.verify_active("global-here").expect("verdict"));
        assert!(!allocator.verify_active("global-there").expect("verdict"));
        assert!(allocator.verify_active("local-only").expect("verdict"));
        assert!(allocator.verify_active("unknown").is_err());
    }

    #[test]
    fn standby_verdicts_mirror_the_remote_cluster() {
        let allocator = TaskAllocator::new("local", directory());

        assert!(allocator
            .verify_standby("remote", "global-there")
            .expect("verdict"));
        assert!(!allocator
            .verify_standby("remote", "global-here")
            .expect("verdict"));
        // local-only domains are nobody's standby concern
        assert!(!allocator
            .verify_standby("remote", "local-only")
            .expect("verdict"));
    }

    #[test]
    fn failover_verdicts_use_the_fixed_target_set() {
        let allocator = TaskAllocator::new("local", directory());
        let targets: BTreeSet<String> = ["d1".to_string()].into();

        assert!(allocator
            .verify_failover_active(&targets, "d1")
            .expect("verdict"));
        assert!(!allocator
            .verify_failover_active(&targets, "d2")
            .expect("verdict"));
    }

    #[test]
    fn pause_blocks_filter_checks_until_resume() {
        let allocator = Arc::new(TaskAllocator::new("local", directory()));
        allocator.pause_processing();

        let worker = {
            let allocator = allocator.clone();
            thread::spawn(move || allocator.verify_active("global-here").expect("verdict"))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished(), "check should wait behind pause");

        allocator.resume_processing();
        assert!(worker.join().expect("should join"));
    }
}
