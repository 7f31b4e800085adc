mod actions;
mod base;
mod cohort;
mod outer;

pub use actions::*;
pub use base::*;
pub use cohort::*;
pub use outer::*;

use crate::queues::QueueError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The targeted processor already shut down. Callers treat this
    /// as a termination signal, not a bug.
    #[error("processor is shut down")]
    Shutdown,

    #[error("unknown cluster {0}")]
    UnknownCluster(String),

    #[error("action timed out waiting for the processor loop")]
    ActionTimeout,

    #[error("action not supported: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
