use std::time::Duration;

/// Callbacks invoked by the [`Publisher`](crate::publishers::Publisher) at
/// every publish disposition.
///
/// All methods default to no-ops, so implementors only wire up the signals
/// they care about - e.g. incrementing counters or feeding a latency
/// histogram.
pub trait MetricsHook: Send + Sync {
    /// A letter reached the broker.
    fn on_published(&self) {}
    /// A letter was acknowledged by the broker (confirm mode only).
    fn on_confirmed(&self) {}
    /// A letter ultimately failed; its failure notification is on the way.
    fn on_failed(&self) {}
    /// A transient failure triggered a retry on a fresh channel.
    fn on_retried(&self) {}
    /// End-to-end duration of one publish, retries included.
    fn on_publish_latency(&self, _elapsed: Duration) {}
}

/// The default hook: ignores every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsHook for NoOpMetrics {}
