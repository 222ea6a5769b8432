pub mod auto;
pub mod batch;

pub use auto::{AutoProcessor, ChainOutcome, ProcessingSession, StopReason};
pub use batch::{BatchOutcome, BatchWorker};
