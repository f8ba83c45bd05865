use std::time::Duration;

/// Errors surfaced by the connection and channel pools.
///
/// Connection and channel faults are recovered internally by the
/// flag-and-rebuild cycle; these kinds only reach the caller once a wait
/// budget is exhausted or the pool has been shut down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open a connection to the AMQP broker")]
    ConnectionOpenFailed(#[source] anyhow::Error),
    #[error("failed to open a channel on a pooled connection")]
    ChannelOpenFailed(#[source] anyhow::Error),
    #[error("no healthy pooled object could be leased within {wait:?}")]
    PoolExhausted { wait: Duration },
    #[error("the pool has been shut down")]
    PoolShutdown,
}

impl Error {
    /// Map a deadpool error, attributing backend-less failures to `or_else`.
    pub(crate) fn from_pool_error<F>(
        err: deadpool::managed::PoolError<Error>,
        wait: Duration,
        or_else: F,
    ) -> Self
    where
        F: FnOnce(anyhow::Error) -> Error,
    {
        use deadpool::managed::PoolError;
        match err {
            PoolError::Backend(e) => e,
            PoolError::Closed => Error::PoolShutdown,
            PoolError::Timeout(_) => Error::PoolExhausted { wait },
            other => or_else(anyhow::anyhow!("{other:?}")),
        }
    }
}
