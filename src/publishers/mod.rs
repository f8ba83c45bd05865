//! Facilities to publish letters to an AMQP broker. Check out [`Publisher`]
//! as a starting point.
mod letter;
mod metrics;
mod publisher;

pub use letter::{DeliveryMode, Envelope, Letter, Notification};
pub use metrics::{MetricsHook, NoOpMetrics};
pub use publisher::{Notifications, PublishError, Publisher, PublisherBuilder};
