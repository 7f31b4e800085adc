// Out-of-band commands for a running processor. Each action travels
// with its own one-shot reply slot; the loop thread is the single
// reader and answers on its own schedule.

use crate::queues::QueueState;
use crate::wakeups::ReplySender;

use super::EngineError;

/// Commands a host may post into a processor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Deep-copies the current queue states out of the loop.
    GetState,

    /// Collapses every collection back into one level-0 queue
    /// starting at the current minimum ack level. Not available on
    /// failover processors.
    Reset,
}

#[derive(Debug)]
pub enum ActionOutcome {
    State(Vec<QueueState>),
    ResetDone,
}

pub struct ActionEnvelope {
    pub action: QueueAction,
    pub reply: ReplySender<Result<ActionOutcome, EngineError>>,
}
