//! Implements [`Manager`] for [`PooledChannel`] and the per-channel
//! delivery-tag ledger used to correlate publisher confirms.

use crate::configuration::PoolSettings;
use deadpool::managed::{self, Manager, Object, RecycleError};
use futures_util::future::try_join_all;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::{BasicProperties, ChannelState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::ConnectionPool;
use super::DrainSignal;

/// A channel leased from the [`ChannelPool`].
///
/// Dropping the lease returns the channel to the pool. Call
/// [`PooledChannel::flag`] first to route it through close-and-rebuild
/// instead.
pub type LeasedChannel = Object<ChannelManager>;

/// One pooled AMQP channel, multiplexed over a pooled connection.
pub struct PooledChannel {
    channel: lapin::Channel,
    channel_id: u64,
    connection_id: u64,
    confirm_mode: bool,
    flagged: AtomicBool,
    confirms: ConfirmLedger,
    drain: Arc<DrainSignal>,
}

impl PooledChannel {
    /// Pool-local identifier, assigned monotonically at creation.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Identifier of the pooled connection this channel rides on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether this channel was placed in publisher-confirms mode at creation.
    pub fn confirm_mode(&self) -> bool {
        self.confirm_mode
    }

    /// Mark this channel as broken. It will be closed and recreated
    /// (possibly on a different connection) before its slot is lent again.
    pub fn flag(&self) {
        self.flagged.store(true, Ordering::SeqCst);
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    /// The delivery-tag ledger of this channel.
    pub fn confirms(&self) -> &ConfirmLedger {
        &self.confirms
    }

    /// Access to the underlying raw channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }

    /// Write a publish frame on this channel.
    ///
    /// The returned [`PublisherConfirm`] resolves with the broker's
    /// disposition on a confirm-mode channel, or immediately with
    /// `Confirmation::NotRequested` otherwise.
    pub async fn publish(
        &self,
        payload: &[u8],
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<PublisherConfirm, lapin::Error> {
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let orphaned = self.confirms.drain();
        if !orphaned.is_empty() {
            // Every orphaned tag belongs to a publish task that observes the
            // channel failure through its own confirm future.
            warn!(
                channel_id = self.channel_id,
                orphaned = orphaned.len(),
                "channel destroyed with unsettled confirms"
            );
        }
        self.drain.release();
    }
}

/// Per-channel table correlating broker delivery tags with letter ids.
///
/// The broker numbers publishes on a confirm-mode channel from 1, one tag
/// per publish. The pool lends a channel to a single caller at a time, so
/// the tags handed out by [`ConfirmLedger::begin`] match the broker's
/// sequence; the table outlives individual leases because tags keep
/// incrementing for the lifetime of the channel.
#[derive(Debug, Default)]
pub struct ConfirmLedger {
    next_tag: AtomicU64,
    outstanding: Mutex<HashMap<u64, u64>>,
}

impl ConfirmLedger {
    /// Record `letter_id` against the next delivery tag, before the frame is
    /// written. The returned guard settles the tag when dropped, whether the
    /// publish resolved or its future was cancelled.
    pub fn begin(&self, letter_id: u64) -> TagGuard<'_> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(tag, letter_id);
        TagGuard { ledger: self, tag }
    }

    fn settle(&self, tag: u64) -> Option<u64> {
        self.lock().remove(&tag)
    }

    /// Empty the table, returning the `(tag, letter_id)` pairs that were
    /// still awaiting a disposition.
    pub fn drain(&self) -> Vec<(u64, u64)> {
        self.lock().drain().collect()
    }

    /// Number of publishes currently awaiting a disposition.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, u64>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// An outstanding delivery tag; settles its ledger entry on drop.
#[must_use]
pub struct TagGuard<'a> {
    ledger: &'a ConfirmLedger,
    tag: u64,
}

impl TagGuard<'_> {
    /// The broker-side delivery tag recorded for this publish.
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Drop for TagGuard<'_> {
    fn drop(&mut self) {
        self.ledger.settle(self.tag);
    }
}

/// `ChannelManager` implements [`Manager`] to create and recycle the
/// channels held by a [`ChannelPool`] sub-pool.
///
/// Channels are multiplexed over the backing [`ConnectionPool`]; leasing a
/// connection per creation spreads channels across the pooled connections.
pub struct ChannelManager {
    connection_pool: ConnectionPool,
    confirm_mode: bool,
    next_id: AtomicU64,
    drain: Arc<DrainSignal>,
}

impl ChannelManager {
    fn new(connection_pool: ConnectionPool, confirm_mode: bool, drain: Arc<DrainSignal>) -> Self {
        Self {
            connection_pool,
            confirm_mode,
            next_id: AtomicU64::new(0),
            drain,
        }
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = PooledChannel;
    type Error = super::Error;

    async fn create(&self) -> Result<PooledChannel, super::Error> {
        let connection = self.connection_pool.get().await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                // A channel-open failure is a connection-level fault: flag
                // the connection so its slot is rebuilt as well.
                connection.flag();
                return Err(super::Error::ChannelOpenFailed(e.into()));
            }
        };
        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|e| super::Error::ChannelOpenFailed(e.into()))?;
        }
        let channel_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel_id,
            connection_id = connection.connection_id(),
            confirm_mode = self.confirm_mode,
            "opened pooled AMQP channel"
        );
        self.drain.register();
        Ok(PooledChannel {
            channel,
            channel_id,
            connection_id: connection.connection_id(),
            confirm_mode: self.confirm_mode,
            flagged: AtomicBool::new(false),
            confirms: ConfirmLedger::default(),
            drain: Arc::clone(&self.drain),
        })
    }

    async fn recycle(&self, obj: &mut PooledChannel) -> managed::RecycleResult<super::Error> {
        if obj.is_flagged() {
            return Err(RecycleError::Message(format!(
                "channel {} is flagged for reconnect",
                obj.channel_id(),
            )));
        }
        match obj.raw().status().state() {
            ChannelState::Connected => Ok(()),
            state => Err(RecycleError::Message(format!(
                "channel {} is not in a healthy state {state:?}",
                obj.channel_id(),
            ))),
        }
    }
}

/// Bounded pools of plain and confirm-mode channels over one connection pool.
///
/// Plain and confirm-mode channels are segregated because `confirm.select`
/// is a one-way switch on an AMQP channel.
#[derive(Clone)]
pub struct ChannelPool {
    plain: managed::Pool<ChannelManager>,
    confirm: managed::Pool<ChannelManager>,
    connection_pool: ConnectionPool,
    owns_connection_pool: bool,
    drain: Arc<DrainSignal>,
    lease_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ChannelPool {
    /// Build channel pools on top of a connection pool shared with other
    /// components. `shutdown` will not cascade to the connection pool.
    pub fn shared(connection_pool: ConnectionPool, settings: &PoolSettings) -> Self {
        Self::build(connection_pool, settings, false)
    }

    /// Build channel pools together with a dedicated connection pool, owned
    /// by this channel pool: `shutdown` cascades to it.
    pub fn owned(
        seasoning: &crate::configuration::Seasoning,
    ) -> Result<Self, anyhow::Error> {
        let factory = crate::amqp::ConnectionFactory::new_from_config(&seasoning.broker)?;
        let connection_pool = ConnectionPool::new(factory, &seasoning.pools);
        Ok(Self::build(connection_pool, &seasoning.pools, true))
    }

    fn build(
        connection_pool: ConnectionPool,
        settings: &PoolSettings,
        owns_connection_pool: bool,
    ) -> Self {
        // Both sub-pools report into one drain signal: shutdown waits for
        // every channel, plain and confirm alike.
        let drain = Arc::new(DrainSignal::default());
        let plain = managed::Pool::builder(ChannelManager::new(
            connection_pool.clone(),
            false,
            Arc::clone(&drain),
        ))
        .max_size(settings.max_channels)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .expect("could not build the channel pool, this is a bug in letterbox");
        let confirm = managed::Pool::builder(ChannelManager::new(
            connection_pool.clone(),
            true,
            Arc::clone(&drain),
        ))
        .max_size(settings.max_confirm_channels)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .expect("could not build the confirm channel pool, this is a bug in letterbox");
        Self {
            plain,
            confirm,
            connection_pool,
            owns_connection_pool,
            drain,
            lease_timeout: settings.lease_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }

    /// Lease a plain channel (no publisher confirms).
    pub async fn get(&self) -> Result<LeasedChannel, super::Error> {
        self.lease(&self.plain).await
    }

    /// Lease a channel in publisher-confirms mode.
    pub async fn get_confirm(&self) -> Result<LeasedChannel, super::Error> {
        self.lease(&self.confirm).await
    }

    async fn lease(
        &self,
        pool: &managed::Pool<ChannelManager>,
    ) -> Result<LeasedChannel, super::Error> {
        let wait = self.lease_timeout;
        match tokio::time::timeout(wait, pool.get()).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(err)) => Err(super::Error::from_pool_error(
                err,
                wait,
                super::Error::ChannelOpenFailed,
            )),
            Err(_) => Err(super::Error::PoolExhausted { wait }),
        }
    }

    /// Open every plain and confirm channel slot up front.
    pub async fn warm_up(&self) -> Result<(), super::Error> {
        let plain = try_join_all((0..self.plain.status().max_size).map(|_| self.get()));
        let confirm = try_join_all((0..self.confirm.status().max_size).map(|_| self.get_confirm()));
        let _held = futures_util::try_join!(plain, confirm)?;
        Ok(())
    }

    /// Reject new leases, wait for outstanding ones to come home (bounded by
    /// the configured shutdown budget) and close every channel. Cascades to
    /// the connection pool when this pool owns it.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.plain.close();
        self.confirm.close();
        self.drain.drained(self.shutdown_timeout).await;
        if self.owns_connection_pool {
            self.connection_pool.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.plain.is_closed() && self.confirm.is_closed()
    }

    /// The backing connection pool.
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    /// Live `(plain, confirm)` channel counts; never exceed the configured
    /// maxima.
    pub fn live(&self) -> (usize, usize) {
        (self.plain.status().size, self.confirm.status().size)
    }
}
