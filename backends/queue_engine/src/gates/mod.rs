// Timer gates hold back timer-queue polling until the earliest
// pending timer is due. The local variant reads the wall clock; the
// remote variant only moves when the owning processor feeds it the
// remote cluster's clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::wakeups::WakeSignal;

/// A single-target timer gate. `update` narrows the target to the
/// earliest due timestamp; `poll_fired` consumes the target once it
/// is due against the gate's notion of "now".
pub trait TimerGate: Send + Sync {
    /// Proposes a fire target. Keeps the earlier of the current and
    /// proposed targets; returns true when the target moved.
    fn update(&self, target: DateTime<Utc>) -> bool;

    fn next_target(&self) -> Option<DateTime<Utc>>;

    /// True exactly once per reached target.
    fn poll_fired(&self) -> bool;

    /// Feeds the externally-supplied cluster clock. Only meaningful
    /// for remote gates; local gates ignore it.
    fn set_current_time(&self, now: DateTime<Utc>);

    /// How long the owning loop may sleep before this gate could
    /// fire. `None` means the gate will never fire by elapsed wall
    /// time and only a notification can change that.
    fn wait_hint(&self) -> Option<Duration>;
}

/// [`LocalTimerGate`] fires against the real clock.
pub struct LocalTimerGate {
    target: Mutex<Option<DateTime<Utc>>>,
    signal: Arc<WakeSignal>,
}

impl LocalTimerGate {
    #[must_use]
    pub fn new(signal: Arc<WakeSignal>) -> Self {
        Self {
            target: Mutex::new(None),
            signal,
        }
    }
}

impl TimerGate for LocalTimerGate {
    fn update(&self, target: DateTime<Utc>) -> bool {
        let mut current = self.target.lock().expect("timer gate lock poisoned");
        match *current {
            Some(existing) if existing <= target => false,
            _ => {
                *current = Some(target);
                drop(current);
                self.signal.notify();
                true
            }
        }
    }

    fn next_target(&self) -> Option<DateTime<Utc>> {
        *self.target.lock().expect("timer gate lock poisoned")
    }

    fn poll_fired(&self) -> bool {
        let mut current = self.target.lock().expect("timer gate lock poisoned");
        match *current {
            Some(target) if target <= Utc::now() => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    fn set_current_time(&self, _now: DateTime<Utc>) {}

    fn wait_hint(&self) -> Option<Duration> {
        let target = (*self.target.lock().expect("timer gate lock poisoned"))?;
        Some((target - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// [`RemoteTimerGate`] fires against a caller-fed cluster clock and
/// never by wall clock alone.
pub struct RemoteTimerGate {
    target: Mutex<Option<DateTime<Utc>>>,
    current_time: Mutex<DateTime<Utc>>,
    signal: Arc<WakeSignal>,
}

impl RemoteTimerGate {
    #[must_use]
    pub fn new(signal: Arc<WakeSignal>) -> Self {
        Self {
            target: Mutex::new(None),
            current_time: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            signal,
        }
    }

    #[must_use]
    pub fn current_time(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .expect("remote clock lock poisoned")
    }
}

impl TimerGate for RemoteTimerGate {
    fn update(&self, target: DateTime<Utc>) -> bool {
        let mut current = self.target.lock().expect("timer gate lock poisoned");
        match *current {
            Some(existing) if existing <= target => false,
            _ => {
                *current = Some(target);
                drop(current);
                self.signal.notify();
                true
            }
        }
    }

    fn next_target(&self) -> Option<DateTime<Utc>> {
        *self.target.lock().expect("timer gate lock poisoned")
    }

    fn poll_fired(&self) -> bool {
        let now = self.current_time();
        let mut current = self.target.lock().expect("timer gate lock poisoned");
        match *current {
            Some(target) if target <= now => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// The remote clock only moves forward; stale feeds are dropped.
    fn set_current_time(&self, now: DateTime<Utc>) {
        let mut current = self
            .current_time
            .lock()
            .expect("remote clock lock poisoned");
        if now > *current {
            *current = now;
            drop(current);
            self.signal.notify();
        }
    }

    fn wait_hint(&self) -> Option<Duration> {
        None
    }
}

/// Gate for transfer queues: nothing to hold back.
pub struct OpenGate;

impl TimerGate for OpenGate {
    fn update(&self, _target: DateTime<Utc>) -> bool {
        false
    }

    fn next_target(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn poll_fired(&self) -> bool {
        false
    }

    fn set_current_time(&self, _now: DateTime<Utc>) {}

    fn wait_hint(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod test_timer_gates {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::{LocalTimerGate, RemoteTimerGate, TimerGate};
    use crate::wakeups::WakeSignal;

    #[test]
    fn local_gate_fires_once_past_target() {
        let gate = LocalTimerGate::new(Arc::new(WakeSignal::new()));
        assert!(!gate.poll_fired());

        assert!(gate.update(Utc::now() - chrono::Duration::seconds(1)));
        assert!(gate.poll_fired());
        assert!(!gate.poll_fired());
    }

    #[test]
    fn local_gate_keeps_earlier_target() {
        let gate = LocalTimerGate::new(Arc::new(WakeSignal::new()));
        let near = Utc::now() + chrono::Duration::seconds(10);
        let far = Utc::now() + chrono::Duration::seconds(60);

        assert!(gate.update(far));
        assert!(gate.update(near));
        assert!(!gate.update(far));
        assert_eq!(gate.next_target(), Some(near));

        let hint = gate.wait_hint().expect("target set, hint expected");
        assert!(hint <= Duration::from_secs(10));
    }

    #[test]
    fn remote_gate_ignores_wall_clock() {
        let gate = RemoteTimerGate::new(Arc::new(WakeSignal::new()));
        gate.update(Utc::now() - chrono::Duration::hours(1));

        // the target is long past by wall clock, yet the remote clock
        // never advanced
        assert!(!gate.poll_fired());
        assert_eq!(gate.wait_hint(), None);

        gate.set_current_time(Utc::now());
        assert!(gate.poll_fired());
    }

    #[test]
    fn remote_clock_is_monotonic() {
        let gate = RemoteTimerGate::new(Arc::new(WakeSignal::new()));
        let now = Utc::now();

        gate.set_current_time(now);
        gate.set_current_time(now - chrono::Duration::seconds(30));
        assert_eq!(gate.current_time(), now);
    }
}
