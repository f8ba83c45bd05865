//! Pooling for AMQP connections and channels, built on [`deadpool`].
//!
//! The pools provide the recovery discipline of the publishing layer:
//! - a flagged or dead object is never lent; it is destroyed and rebuilt
//!   (with exponential backoff for connections) before its slot is reused;
//! - leases wait for a healthy object up to a configured budget, after which
//!   [`Error::PoolExhausted`] is surfaced;
//! - channels are multiplexed over the connection pool and segregated into
//!   plain and publisher-confirms sub-pools.
//!
//! ```rust
//! use letterbox::amqp::ConnectionFactory;
//! use letterbox::configuration::Seasoning;
//! use letterbox::pool::{ChannelPool, ConnectionPool};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     let seasoning = Seasoning::default();
//!
//!     let factory = ConnectionFactory::new_from_config(&seasoning.broker)?;
//!     let connection_pool = ConnectionPool::new(factory, &seasoning.pools);
//!     let channel_pool = ChannelPool::shared(connection_pool, &seasoning.pools);
//!
//!     // Lease a channel in publisher-confirms mode.
//!     let channel = channel_pool.get_confirm().await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool, ConfirmLedger, LeasedChannel, PooledChannel, TagGuard};
pub use connection::{ConnectionManager, ConnectionPool, LeasedConnection, PooledConnection};
pub use error::Error;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Event-driven accounting of live pooled objects.
///
/// Objects register at creation and release from their `Drop` impl;
/// `shutdown` blocks on [`DrainSignal::drained`] instead of polling, and is
/// woken the moment the last outstanding lease comes home.
#[derive(Debug, Default)]
pub(crate) struct DrainSignal {
    live: AtomicUsize,
    drained: Notify,
}

impl DrainSignal {
    pub(crate) fn register(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait until every registered object has been released, bounded by
    /// `deadline`.
    pub(crate) async fn drained(&self, deadline: Duration) {
        let all_released = async {
            loop {
                // Register the waiter before checking the count, so a
                // release racing with the check cannot be missed.
                let notified = self.drained.notified();
                if self.live() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(deadline, all_released).await.is_err() {
            tracing::warn!(
                outstanding = self.live(),
                "pool shutdown deadline elapsed with leases still outstanding"
            );
        }
    }
}
