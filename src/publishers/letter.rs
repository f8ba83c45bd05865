use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use crate::publishers::PublishError;

/// The unit of work handed to a [`Publisher`](crate::publishers::Publisher).
///
/// Letters are immutable once submitted: the publisher never mutates them,
/// and on failure the original letter travels back to the caller inside the
/// [`Notification`] for easy resubmission.
#[derive(Debug, Clone)]
pub struct Letter {
    /// Caller-assigned identifier, echoed on the resulting notification.
    /// Opaque to the broker.
    pub letter_id: u64,
    /// Maximum in-publisher retries on transient failures before giving up.
    pub retry_count: u32,
    /// The message payload.
    pub body: Vec<u8>,
    /// Broker routing metadata.
    pub envelope: Envelope,
}

impl Letter {
    pub fn new(letter_id: u64, body: Vec<u8>, envelope: Envelope) -> Self {
        Self {
            letter_id,
            retry_count: 3,
            body,
            envelope,
        }
    }

    /// A letter addressed straight to `queue` through the default exchange.
    pub fn to_queue(letter_id: u64, queue: &str, body: Vec<u8>) -> Self {
        Self::new(
            letter_id,
            body,
            Envelope {
                routing_key: queue.into(),
                ..Envelope::default()
            },
        )
    }

    /// Override the retry budget.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Broker routing metadata attached to a [`Letter`].
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The exchange to publish to; the empty string is the default exchange,
    /// which routes straight to the queue named by `routing_key`.
    pub exchange: String,
    /// The routing key used by the exchange to pick destination queues.
    pub routing_key: String,
    /// MIME content type recorded on the message properties.
    pub content_type: String,
    /// If `true`, the broker returns the message when it cannot be routed to
    /// any queue instead of silently dropping it.
    pub mandatory: bool,
    /// The immediate flag was dropped in RabbitMQ 3.0 - setting `true`
    /// against such brokers causes a not-supported error.
    pub immediate: bool,
    /// Whether the broker should persist the message to disk.
    pub delivery_mode: DeliveryMode,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            routing_key: String::new(),
            content_type: "application/octet-stream".into(),
            mandatory: false,
            immediate: false,
            delivery_mode: DeliveryMode::Persistent,
        }
    }
}

impl Envelope {
    pub(crate) fn publish_options(&self) -> BasicPublishOptions {
        BasicPublishOptions {
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }

    /// Build the AMQP properties block for one publish: content type and
    /// delivery mode from the envelope, plus a fresh message id and the
    /// current timestamp.
    pub(crate) fn properties(&self) -> BasicProperties {
        let properties = BasicProperties::default()
            .with_content_type(self.content_type.as_str().into())
            .with_delivery_mode(self.delivery_mode.as_amqp())
            .with_message_id(Uuid::new_v4().to_string().into());
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => properties.with_timestamp(now.as_secs()),
            Err(_) => {
                warn!("system time is before 1970");
                properties
            }
        }
    }
}

/// AMQP delivery mode: transient (1) or persistent (2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// The numeric value carried on the wire.
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

impl TryFrom<u8> for DeliveryMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeliveryMode::Transient),
            2 => Ok(DeliveryMode::Persistent),
            other => Err(format!("invalid delivery mode {other}, expected 1 or 2")),
        }
    }
}

/// The result record emitted for every completed publish attempt.
///
/// Exactly one notification is delivered per accepted letter. Failures carry
/// the original letter so the caller can resubmit it.
#[derive(Debug)]
pub struct Notification {
    /// Echo of the submitted [`Letter::letter_id`].
    pub letter_id: u64,
    /// Whether the publish ultimately succeeded.
    pub success: bool,
    /// Failure detail, if any.
    pub error: Option<PublishError>,
    /// The original letter, handed back on failure for resubmission.
    pub failed_letter: Option<Letter>,
}

impl Notification {
    pub(crate) fn delivered(letter_id: u64) -> Self {
        Self {
            letter_id,
            success: true,
            error: None,
            failed_letter: None,
        }
    }

    pub(crate) fn failed(letter: Letter, error: PublishError) -> Self {
        Self {
            letter_id: letter.letter_id,
            success: false,
            error: Some(error),
            failed_letter: Some(letter),
        }
    }
}
