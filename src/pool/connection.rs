//! Implements [`Manager`] for [`PooledConnection`].

use crate::amqp::ConnectionFactory;
use crate::configuration::{BackoffSettings, PoolSettings};
use deadpool::managed::{self, Manager, Object, RecycleError};
use futures_util::future::try_join_all;
use lapin::ConnectionState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::DrainSignal;

/// A connection leased from the [`ConnectionPool`].
///
/// Dropping the lease returns the connection to the pool. Call
/// [`PooledConnection::flag`] first to route it through close-and-rebuild
/// instead.
pub type LeasedConnection = Object<ConnectionManager>;

/// One pooled AMQP connection.
///
/// A pooled connection is either healthy and ready to lend, or flagged for
/// reconnect; a flagged connection is destroyed and reopened before its slot
/// is lent again.
pub struct PooledConnection {
    connection: lapin::Connection,
    connection_id: u64,
    flagged: AtomicBool,
    drain: Arc<DrainSignal>,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.drain.release();
    }
}

impl PooledConnection {
    /// Pool-local identifier, assigned monotonically at creation.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Mark this connection as broken. It will be closed and reopened before
    /// its slot is lent again.
    pub fn flag(&self) {
        self.flagged.store(true, Ordering::SeqCst);
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    /// Access to the underlying raw connection.
    pub fn raw(&self) -> &lapin::Connection {
        &self.connection
    }

    pub(crate) async fn create_channel(&self) -> Result<lapin::Channel, lapin::Error> {
        self.connection.create_channel().await
    }
}

/// `ConnectionManager` implements [`Manager`] to create and recycle the
/// connections held by a [`ConnectionPool`].
pub struct ConnectionManager {
    connection_factory: ConnectionFactory,
    rebuild_backoff: BackoffSettings,
    next_id: AtomicU64,
    drain: Arc<DrainSignal>,
}

impl ConnectionManager {
    fn new(
        connection_factory: ConnectionFactory,
        rebuild_backoff: BackoffSettings,
        drain: Arc<DrainSignal>,
    ) -> Self {
        Self {
            connection_factory,
            rebuild_backoff,
            next_id: AtomicU64::new(0),
            drain,
        }
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = PooledConnection;
    type Error = super::Error;

    async fn create(&self) -> Result<PooledConnection, super::Error> {
        let connection = self
            .connection_factory
            .new_connection_with_backoff(&self.rebuild_backoff)
            .await
            .map_err(super::Error::ConnectionOpenFailed)?;

        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id, "opened pooled AMQP connection");
        self.drain.register();
        Ok(PooledConnection {
            connection,
            connection_id,
            flagged: AtomicBool::new(false),
            drain: Arc::clone(&self.drain),
        })
    }

    async fn recycle(&self, obj: &mut PooledConnection) -> managed::RecycleResult<super::Error> {
        if obj.is_flagged() {
            return Err(RecycleError::Message(format!(
                "connection {} is flagged for reconnect",
                obj.connection_id(),
            )));
        }
        match obj.raw().status().state() {
            ConnectionState::Connected => Ok(()),
            state => Err(RecycleError::Message(format!(
                "connection {} is not in a healthy state {state:?}",
                obj.connection_id(),
            ))),
        }
    }
}

/// A bounded pool of long-lived AMQP connections.
///
/// Leases wait for a healthy connection up to the configured budget; a
/// flagged or disconnected object is never lent, it is destroyed and
/// reopened (with backoff) the next time its slot is needed.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: managed::Pool<ConnectionManager>,
    drain: Arc<DrainSignal>,
    lease_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ConnectionPool {
    /// Build a pool of at most `settings.max_connections` connections.
    ///
    /// Construction is lazy: connections are opened on first need. Use
    /// [`ConnectionPool::warm_up`] to open every slot eagerly.
    pub fn new(connection_factory: ConnectionFactory, settings: &PoolSettings) -> Self {
        let drain = Arc::new(DrainSignal::default());
        let manager = ConnectionManager::new(
            connection_factory,
            settings.rebuild_backoff.clone(),
            Arc::clone(&drain),
        );
        let inner = managed::Pool::builder(manager)
            .max_size(settings.max_connections)
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .expect("could not build the connection pool, this is a bug in letterbox");
        Self {
            inner,
            drain,
            lease_timeout: settings.lease_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }

    /// Lease a healthy connection, waiting up to the configured budget.
    pub async fn get(&self) -> Result<LeasedConnection, super::Error> {
        let wait = self.lease_timeout;
        match tokio::time::timeout(wait, self.inner.get()).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(err)) => Err(super::Error::from_pool_error(
                err,
                wait,
                super::Error::ConnectionOpenFailed,
            )),
            Err(_) => Err(super::Error::PoolExhausted { wait }),
        }
    }

    /// Open every slot up front.
    ///
    /// The first connection that cannot be opened within the backoff budget
    /// fails the warm-up with `ConnectionOpenFailed`.
    pub async fn warm_up(&self) -> Result<(), super::Error> {
        let max_size = self.inner.status().max_size;
        // Dropping the leases hands every opened connection back to the pool.
        let _held = try_join_all((0..max_size).map(|_| self.get())).await?;
        Ok(())
    }

    /// Reject new leases, wait for outstanding ones to come home (bounded by
    /// the configured shutdown budget) and close every connection.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.inner.close();
        self.drain.drained(self.shutdown_timeout).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of live connections; never exceeds the configured maximum.
    pub fn live(&self) -> usize {
        self.inner.status().size
    }

}
