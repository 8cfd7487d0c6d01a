//! Event emitter abstraction for decoupling pipeline internals from transport.

use super::PipelineEvent;

/// Trait for emitting pipeline events without knowledge of transport.
///
/// A [`Pipeline`](crate::pipeline::Pipeline) depends on `Arc<dyn EventEmitter>`
/// rather than a concrete channel, so a headless server, a GUI host or a test
/// harness can each supply their own delivery mechanism.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards every event. Used where nothing observes pipeline state.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Logs every event at debug level via `log`.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: PipelineEvent) {
        log::debug!("{event:?}");
    }
}
