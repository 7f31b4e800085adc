// Token-bucket gate bounding persistence reads per second. The
// refill rate is a live config cell so operators can throttle a
// misbehaving shard without a restart.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Dyn;

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

/// [`RateGate`] hands out one token per permitted poll. Denials come
/// back with the wait that would make the next token available, so
/// the caller can schedule its wakeup instead of spinning.
pub struct RateGate {
    rps: Dyn<u32>,
    state: Mutex<BucketState>,
}

impl RateGate {
    #[must_use]
    pub fn new(rps: Dyn<u32>) -> Self {
        let burst = f64::from(rps.get().max(1));
        Self {
            rps,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }
    }

    /// Takes one token, or reports how long until one is due.
    pub fn try_take(&self) -> Result<(), Duration> {
        let rps = f64::from(self.rps.get().max(1));
        let mut state = self.state.lock().expect("rate gate lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        // burst capacity tracks the configured rate one-to-one
        state.tokens = (state.tokens + elapsed * rps).min(rps);
        state.refilled = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / rps))
        }
    }
}

#[cfg(test)]
mod test_rate_gate {
    use std::time::Duration;

    use super::RateGate;
    use crate::config::Dyn;

    #[test]
    fn burst_up_to_rate_then_denies() {
        let gate = RateGate::new(Dyn::new(5));
        for _ in 0..5 {
            assert!(gate.try_take().is_ok());
        }

        let wait = gate.try_take().expect_err("bucket should be empty");
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(200));
    }

    #[test]
    fn refills_over_time() {
        let gate = RateGate::new(Dyn::new(1000));
        for _ in 0..1000 {
            assert!(gate.try_take().is_ok());
        }

        std::thread::sleep(Duration::from_millis(20));
        assert!(gate.try_take().is_ok());
    }

    #[test]
    fn rate_change_applies_immediately() {
        let rps = Dyn::new(1);
        let gate = RateGate::new(rps.clone());
        assert!(gate.try_take().is_ok());
        assert!(gate.try_take().is_err());

        rps.set(1000);
        std::thread::sleep(Duration::from_millis(5));
        assert!(gate.try_take().is_ok());
    }
}
