// Wakeup primitives shared by the processor loops: an atomic on/off
// toggle, a condvar wake signal with deadline waits, an event channel
// that wakes its receiver, and a one-shot reply slot for actions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use concurrent_queue::{ConcurrentQueue, PopError, PushError};
use derive_more::derive::{Display, Error};

const SET: usize = 1;
const UNSET: usize = 0;

/// One-way latch used for shutdown signalling.
#[derive(Debug)]
pub struct Toggle {
    state: AtomicUsize,
}

impl Default for Toggle {
    fn default() -> Self {
        Self::new()
    }
}

impl Toggle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNSET),
        }
    }

    /// Flips UNSET to SET; returns false when already set.
    #[inline]
    pub fn turn_on(&self) -> bool {
        self.state
            .compare_exchange(UNSET, SET, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    #[must_use]
    pub fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire) == SET
    }
}

/// [`WakeSignal`] sleeps a loop thread until either a notification
/// arrives or a deadline passes. Notifications are latched: a notify
/// racing ahead of the wait is not lost.
pub struct WakeSignal {
    notified: Mutex<bool>,
    event: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Notified,
    DeadlineReached,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            event: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut notified = self.notified.lock().expect("wake signal lock poisoned");
        *notified = true;
        drop(notified);
        self.event.notify_all();
    }

    /// Waits until notified or until `deadline`. `None` sleeps without
    /// a deadline. Consumes the latched notification on return.
    pub fn wait_until(&self, deadline: Option<Instant>) -> WakeReason {
        let mut notified = self.notified.lock().expect("wake signal lock poisoned");
        loop {
            if *notified {
                *notified = false;
                return WakeReason::Notified;
            }

            match deadline {
                None => {
                    notified = self
                        .event
                        .wait(notified)
                        .expect("wake signal lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WakeReason::DeadlineReached;
                    }
                    let (guard, _timeout) = self
                        .event
                        .wait_timeout(notified, deadline - now)
                        .expect("wake signal lock poisoned");
                    notified = guard;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ChannelError {
    #[display("ChannelError::Closed")]
    Closed,

    #[display("ChannelError::Timeout")]
    Timeout,
}

/// Sending half of an event channel. Every send wakes the receiver's
/// [`WakeSignal`] so loop deadlines collapse on arrival.
pub struct EventSender<T> {
    chan: Arc<ConcurrentQueue<T>>,
    signal: Arc<WakeSignal>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            chan: self.chan.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl<T> EventSender<T> {
    pub fn send(&self, value: T) -> Result<(), ChannelError> {
        match self.chan.push(value) {
            Ok(()) => {
                self.signal.notify();
                Ok(())
            }
            Err(PushError::Closed(_) | PushError::Full(_)) => Err(ChannelError::Closed),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }
}

/// Receiving half; owned by exactly one loop thread.
pub struct EventReceiver<T> {
    chan: Arc<ConcurrentQueue<T>>,
    signal: Arc<WakeSignal>,
}

impl<T> EventReceiver<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.chan.pop().ok()
    }

    /// Drains everything currently queued without waiting.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        while let Ok(value) = self.chan.pop() {
            drained.push(value);
        }
        drained
    }

    #[must_use]
    pub fn signal(&self) -> Arc<WakeSignal> {
        self.signal.clone()
    }

    pub fn close(&self) {
        self.chan.close();
        self.signal.notify();
    }
}

/// Unbounded event channel wired to a shared wake signal.
#[must_use]
pub fn event_channel<T>(signal: Arc<WakeSignal>) -> (EventSender<T>, EventReceiver<T>) {
    let chan = Arc::new(ConcurrentQueue::unbounded());
    (
        EventSender {
            chan: chan.clone(),
            signal: signal.clone(),
        },
        EventReceiver { chan, signal },
    )
}

/// Sending half of a one-shot reply slot.
pub struct ReplySender<T> {
    chan: Arc<ConcurrentQueue<T>>,
    signal: Arc<WakeSignal>,
}

impl<T> ReplySender<T> {
    /// Delivers the reply; at most one value ever lands.
    pub fn send(self, value: T) {
        // a dropped receiver just discards the reply
        let _ = self.chan.push(value);
        self.signal.notify();
    }
}

/// Receiving half of a one-shot reply slot.
pub struct ReplyReceiver<T> {
    chan: Arc<ConcurrentQueue<T>>,
    signal: Arc<WakeSignal>,
}

impl<T> ReplyReceiver<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.chan.pop() {
                Ok(value) => return Ok(value),
                Err(PopError::Closed) => return Err(ChannelError::Closed),
                Err(PopError::Empty) => {
                    if self.signal.wait_until(Some(deadline)) == WakeReason::DeadlineReached
                        && self.chan.is_empty()
                    {
                        return Err(ChannelError::Timeout);
                    }
                }
            }
        }
    }
}

/// One-shot rendezvous used by the action channel to carry a reply
/// back out of a processor loop.
#[must_use]
pub fn reply_slot<T>() -> (ReplySender<T>, ReplyReceiver<T>) {
    let chan = Arc::new(ConcurrentQueue::bounded(1));
    let signal = Arc::new(WakeSignal::new());
    (
        ReplySender {
            chan: chan.clone(),
            signal: signal.clone(),
        },
        ReplyReceiver { chan, signal },
    )
}
