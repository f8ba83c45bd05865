//! Declarative management of queues and exchanges.
//!
//! [`Topologer`] is a thin collaborator used to stage, inspect and clean
//! broker topology; the publishing path never depends on it.

use lapin::message::BasicGetMessage;
use lapin::options::{
    BasicGetOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;

use crate::pool::ChannelPool;

/// Declares, binds, purges and deletes queues and exchanges against a
/// channel pool.
pub struct Topologer {
    channel_pool: ChannelPool,
}

impl Topologer {
    pub fn new(channel_pool: ChannelPool) -> Self {
        Self { channel_pool }
    }

    /// Create a durable queue.
    #[tracing::instrument(name = "amqp_declare_durable_queue", skip(self))]
    pub async fn declare_durable_queue(&self, queue: &str) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };
        let channel = self.channel_pool.get().await?;
        channel
            .raw()
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    /// Create a durable direct exchange.
    #[tracing::instrument(name = "amqp_declare_durable_exchange", skip(self))]
    pub async fn declare_durable_exchange(&self, exchange: &str) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            // The exchange will survive broker restarts
            durable: true,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        let channel = self.channel_pool.get().await?;
        channel
            .raw()
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await?;
        Ok(())
    }

    /// Bind a queue to an exchange.
    #[tracing::instrument(name = "amqp_bind_queue", skip(self))]
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let channel = self.channel_pool.get().await?;
        channel
            .raw()
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Unbind a queue from an exchange.
    #[tracing::instrument(name = "amqp_unbind_queue", skip(self))]
    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let channel = self.channel_pool.get().await?;
        channel
            .raw()
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    /// Drop every message sitting in a queue; returns how many were purged.
    #[tracing::instrument(name = "amqp_purge_queue", skip(self))]
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, anyhow::Error> {
        let channel = self.channel_pool.get().await?;
        let purged = channel
            .raw()
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await?;
        Ok(purged)
    }

    /// Delete a queue; returns how many messages it still held.
    #[tracing::instrument(name = "amqp_delete_queue", skip(self))]
    pub async fn delete_queue(&self, queue: &str) -> Result<u32, anyhow::Error> {
        let channel = self.channel_pool.get().await?;
        let deleted = channel
            .raw()
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(deleted)
    }

    /// Retrieve the current length of a queue.
    ///
    /// # Implementation details
    ///
    /// The most convenient way to get the length of a queue in AMQP is...
    /// re-declaring it. We use `passive=true` to avoid settings conflicts.
    #[tracing::instrument(name = "amqp_queue_length", skip(self))]
    pub async fn queue_length(&self, queue: &str) -> Result<u32, anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let channel = self.channel_pool.get().await?;
        let queue = channel
            .raw()
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(queue.message_count())
    }

    /// Pull a single message off a queue without acking semantics, for test
    /// round-trips.
    pub async fn get_message(&self, queue: &str) -> Result<Option<BasicGetMessage>, anyhow::Error> {
        let channel = self.channel_pool.get().await?;
        let message = channel
            .raw()
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await?;
        Ok(message)
    }
}
