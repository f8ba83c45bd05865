use lapin::message::BasicReturnMessage;
use lapin::publisher_confirm::Confirmation;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::configuration::{PublisherSettings, Seasoning};
use crate::pool::{ChannelPool, LeasedChannel};
use crate::publishers::{Letter, MetricsHook, NoOpMetrics, Notification};

/// Reply code the broker uses on returned messages that could not be routed
/// to any queue.
/// See <https://www.rabbitmq.com/amqp-0-9-1-reference.html>
const REPLY_NO_ROUTE: u16 = 312;

/// A high-level interface to publish [`Letter`]s.
///
/// Every accepted letter produces exactly one [`Notification`] on the stream
/// returned at build time, whatever happens in between: broker ack, nack,
/// unroutable return, exhausted retries, cancellation. Publish calls never
/// surface errors out-of-band.
///
/// # Fault tolerance
///
/// Channels are leased from a [`ChannelPool`] per publish; a channel that
/// fails is flagged and rebuilt by the pool, and the letter is retried on a
/// fresh channel up to its [`retry_count`](Letter::retry_count).
///
/// # Auto-publish
///
/// [`queue_letter`](Publisher::queue_letter) feeds a bounded internal queue
/// drained by background workers once
/// [`start_auto_publish`](Publisher::start_auto_publish) is called.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step,
/// known as "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

/// Error attached to failure [`Notification`]s and returned by
/// [`Publisher::queue_letter`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to lease a healthy AMQP resource")]
    Pool(#[from] crate::pool::Error),
    #[error("the publish frame could not be written to the channel")]
    PublishWriteFailed(#[source] lapin::Error),
    #[error("the broker nacked the publish: {0:?}")]
    NackedByBroker(Option<Box<BasicReturnMessage>>),
    #[error("the message could not be routed: {0:?}")]
    Unroutable(Box<BasicReturnMessage>),
    #[error("no ack or nack arrived within {timeout:?}")]
    ConfirmTimeout { timeout: Duration },
    #[error("the publish was cancelled by shutdown")]
    Cancelled,
    #[error("the publisher has been stopped")]
    PublisherStopped,
}

impl PublishError {
    /// Whether a fresh channel gives this failure a chance to succeed.
    ///
    /// Broker-reported dispositions (nack, unroutable) are not retried: the
    /// broker already knows about the message. Pool errors are not retried
    /// either, the pool has already spent its own rebuild budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublishError::PublishWriteFailed(_) | PublishError::ConfirmTimeout { .. }
        )
    }
}

/// Read side of the notification stream.
///
/// The stream is bounded: once it fills, publish calls block on emitting
/// their notification until the reader catches up. Size it through
/// [`notification_capacity`](crate::configuration::PublisherSettings::notification_capacity)
/// so that blocking never occurs under normal load.
pub struct Notifications {
    rx: mpsc::Receiver<Notification>,
}

impl Notifications {
    /// Receive the next notification; `None` once the publisher and every
    /// clone of it have been dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Notifications::recv`].
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct AutoPublishRun {
    stop: CancellationToken,
    tasks: JoinSet<()>,
}

struct Inner {
    channel_pool: ChannelPool,
    settings: PublisherSettings,
    metrics: Arc<dyn MetricsHook>,
    notifications_tx: mpsc::Sender<Notification>,
    letters_tx: mpsc::Sender<Letter>,
    letters_rx: tokio::sync::Mutex<mpsc::Receiver<Letter>>,
    state: Mutex<Lifecycle>,
    auto_publish: Mutex<Option<AutoPublishRun>>,
    shutdown: CancellationToken,
}

impl Publisher {
    /// Start building a [`Publisher`] on top of a channel pool.
    pub fn builder(channel_pool: ChannelPool) -> PublisherBuilder {
        PublisherBuilder::new(channel_pool)
    }

    /// Build a publisher straight from a configuration snapshot.
    pub fn new(seasoning: &Seasoning, channel_pool: ChannelPool) -> (Publisher, Notifications) {
        Self::builder(channel_pool).seasoning(seasoning).build()
    }

    /// Publish a letter without waiting for a broker confirm
    /// (at-most-once, best-effort).
    ///
    /// Emits exactly one [`Notification`]. Transient failures are retried on
    /// fresh channels up to the letter's retry budget.
    pub async fn publish(&self, letter: Letter) {
        let notification = self.inner.deliver(letter, false).await;
        self.inner.emit(notification).await;
    }

    /// Publish a letter on a confirm-mode channel and wait for the broker's
    /// ack or nack (at-least-once when it succeeds).
    ///
    /// Emits exactly one [`Notification`] carrying the final disposition.
    /// A confirm that does not arrive within the configured timeout flags
    /// the channel and retries on a fresh one until the letter's retry
    /// budget is exhausted.
    pub async fn publish_with_confirmation(&self, letter: Letter) {
        let notification = self.inner.deliver(letter, true).await;
        self.inner.emit(notification).await;
    }

    /// Enqueue a letter for the auto-publish workers.
    ///
    /// Blocks while the internal queue is full. Fails only when the
    /// publisher has been stopped.
    pub async fn queue_letter(&self, letter: Letter) -> Result<(), PublishError> {
        if *self.inner.state() == Lifecycle::Stopped {
            return Err(PublishError::PublisherStopped);
        }
        self.inner
            .letters_tx
            .send(letter)
            .await
            .map_err(|_| PublishError::PublisherStopped)
    }

    /// Spawn the auto-publish workers if they are not already running.
    ///
    /// Idempotent. Workers drain the internal queue and publish each letter
    /// with or without confirmation, per
    /// [`publish_with_confirmation`](crate::configuration::PublisherSettings::publish_with_confirmation).
    pub fn start_auto_publish(&self) {
        let mut state = self.inner.state();
        if matches!(*state, Lifecycle::Running | Lifecycle::Stopping) {
            return;
        }
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for worker in 0..self.inner.settings.workers.max(1) {
            tasks.spawn(auto_publish_worker(
                Arc::clone(&self.inner),
                stop.clone(),
                worker,
            ));
        }
        *self.inner.auto_publish() = Some(AutoPublishRun { stop, tasks });
        *state = Lifecycle::Running;
    }

    /// Signal the auto-publish workers to finish the letter they hold and
    /// exit; returns once they have.
    ///
    /// Letters still sitting in the queue stay there for a later
    /// [`start_auto_publish`](Publisher::start_auto_publish). Notifications
    /// already in flight are still delivered.
    pub async fn stop_auto_publish(&self) {
        let run = {
            let mut state = self.inner.state();
            if *state != Lifecycle::Running {
                return;
            }
            *state = Lifecycle::Stopping;
            self.inner.auto_publish().take()
        };

        if let Some(mut run) = run {
            run.stop.cancel();
            let drain = self.inner.settings.drain_timeout();
            let drained = tokio::time::timeout(drain, async {
                while run.tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(?drain, "auto-publish workers did not drain in time, aborting them");
                run.tasks.abort_all();
                while run.tasks.join_next().await.is_some() {}
            }
        }

        *self.inner.state() = Lifecycle::Stopped;
    }

    /// Cancel every in-flight publish, then stop the auto-publish workers.
    ///
    /// Publishes interrupted by the cancellation resolve as failure
    /// notifications of kind [`PublishError::Cancelled`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_auto_publish().await;
    }

    /// The channel pool this publisher leases from.
    pub fn channel_pool(&self) -> &ChannelPool {
        &self.inner.channel_pool
    }
}

async fn auto_publish_worker(inner: Arc<Inner>, stop: CancellationToken, worker: usize) {
    debug!(worker, "auto-publish worker started");
    loop {
        // The receiver lock is held only while waiting for a letter, so
        // workers take turns on the queue but publish concurrently.
        let letter = {
            let mut letters = inner.letters_rx.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                letter = letters.recv() => letter,
            }
        };
        let Some(letter) = letter else { break };
        let confirm = inner.settings.publish_with_confirmation;
        let notification = inner.deliver(letter, confirm).await;
        inner.emit(notification).await;
    }
    debug!(worker, "auto-publish worker stopped");
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auto_publish(&self) -> MutexGuard<'_, Option<AutoPublishRun>> {
        self.auto_publish
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn emit(&self, notification: Notification) {
        // Blocks once the stream is full: the reader's pace bounds memory.
        if self.notifications_tx.send(notification).await.is_err() {
            debug!("notification dropped, the stream reader is gone");
        }
    }

    /// Run one letter to its final disposition, retrying transient failures
    /// on fresh channels up to the letter's budget.
    async fn deliver(&self, letter: Letter, confirm: bool) -> Notification {
        if *self.state() == Lifecycle::Stopped {
            self.metrics.on_failed();
            return Notification::failed(letter, PublishError::PublisherStopped);
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        let outcome = loop {
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(PublishError::Cancelled),
                result = self.publish_once(&letter, confirm) => result,
            };
            match attempt {
                Ok(()) => break Ok(()),
                Err(error) if error.is_retryable() && attempts < letter.retry_count => {
                    attempts += 1;
                    self.metrics.on_retried();
                    debug!(
                        letter_id = letter.letter_id,
                        attempts,
                        %error,
                        "publish failed, retrying on a fresh channel"
                    );
                }
                Err(error) => break Err(error),
            }
        };
        self.metrics.on_publish_latency(started.elapsed());

        match outcome {
            Ok(()) => {
                self.metrics.on_published();
                if confirm {
                    self.metrics.on_confirmed();
                }
                Notification::delivered(letter.letter_id)
            }
            Err(error) => {
                self.metrics.on_failed();
                Notification::failed(letter, error)
            }
        }
    }

    /// One publish attempt on a freshly leased channel.
    async fn publish_once(&self, letter: &Letter, confirm: bool) -> Result<(), PublishError> {
        let channel = if confirm {
            self.channel_pool.get_confirm().await?
        } else {
            self.channel_pool.get().await?
        };

        if confirm {
            self.publish_confirmed(&channel, letter).await
        } else {
            self.publish_unconfirmed(&channel, letter).await
        }
    }

    async fn publish_unconfirmed(
        &self,
        channel: &LeasedChannel,
        letter: &Letter,
    ) -> Result<(), PublishError> {
        let envelope = &letter.envelope;
        let sent = channel
            .publish(
                &letter.body,
                &envelope.exchange,
                &envelope.routing_key,
                envelope.publish_options(),
                envelope.properties(),
            )
            .await
            .map_err(|e| {
                channel.flag();
                PublishError::PublishWriteFailed(e)
            })?;
        // Resolves as `NotRequested` once the frame has been written.
        sent.await.map_err(|e| {
            channel.flag();
            PublishError::PublishWriteFailed(e)
        })?;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        channel: &LeasedChannel,
        letter: &Letter,
    ) -> Result<(), PublishError> {
        // Record the delivery-tag mapping before the frame goes out; the
        // guard settles it on every exit path, cancellation included.
        let _tag = channel.confirms().begin(letter.letter_id);

        let envelope = &letter.envelope;
        let sent = channel
            .publish(
                &letter.body,
                &envelope.exchange,
                &envelope.routing_key,
                envelope.publish_options(),
                envelope.properties(),
            )
            .await
            .map_err(|e| {
                channel.flag();
                PublishError::PublishWriteFailed(e)
            })?;

        let timeout = self.settings.confirm_timeout();
        let confirmation = match tokio::time::timeout(timeout, sent).await {
            Err(_) => {
                channel.flag();
                return Err(PublishError::ConfirmTimeout { timeout });
            }
            Ok(Err(e)) => {
                channel.flag();
                return Err(PublishError::PublishWriteFailed(e));
            }
            Ok(Ok(confirmation)) => confirmation,
        };

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(returned)) => {
                if returned.reply_code == REPLY_NO_ROUTE {
                    Err(PublishError::Unroutable(returned))
                } else {
                    Ok(())
                }
            }
            Confirmation::Nack(returned) => Err(PublishError::NackedByBroker(returned)),
            Confirmation::NotRequested => {
                unreachable!("confirm-mode channels ack or nack every publish")
            }
        }
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    channel_pool: ChannelPool,
    settings: PublisherSettings,
    metrics: Arc<dyn MetricsHook>,
}

impl PublisherBuilder {
    fn new(channel_pool: ChannelPool) -> Self {
        Self {
            channel_pool,
            settings: PublisherSettings::default(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Replace the publisher settings wholesale.
    #[must_use]
    pub fn settings(mut self, settings: PublisherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Take the publisher settings from a configuration snapshot.
    #[must_use]
    pub fn seasoning(self, seasoning: &Seasoning) -> Self {
        self.settings(seasoning.publisher.clone())
    }

    /// Register a metrics hook invoked at every publish disposition.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsHook>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Finalise the builder: the [`Publisher`] plus the single read side of
    /// its notification stream.
    pub fn build(self) -> (Publisher, Notifications) {
        let (notifications_tx, notifications_rx) =
            mpsc::channel(self.settings.notification_capacity());
        let (letters_tx, letters_rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let publisher = Publisher {
            inner: Arc::new(Inner {
                channel_pool: self.channel_pool,
                settings: self.settings,
                metrics: self.metrics,
                notifications_tx,
                letters_tx,
                letters_rx: tokio::sync::Mutex::new(letters_rx),
                state: Mutex::new(Lifecycle::Created),
                auto_publish: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        };
        (publisher, Notifications {
            rx: notifications_rx,
        })
    }
}
