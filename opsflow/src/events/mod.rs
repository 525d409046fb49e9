//! Observability events emitted by the coordinator and the workflows.

pub mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
