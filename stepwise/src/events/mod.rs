//! Lifecycle events.
//!
//! The [`PipelineInvoker`](crate::invoker::PipelineInvoker) owns one
//! [`EventSink`] and reports pipeline, step-group and step lifecycle events
//! to it. There is no process-global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
