//! Core types shared across the coordinator and the workflows.

pub mod event;
pub mod status;

pub use event::{CompletionOutcome, HistoryEvent, RecordedEvent};
pub use status::ExecutionStatus;
