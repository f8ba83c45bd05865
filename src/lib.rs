//! `letterbox` is a fault-tolerant publishing layer on top of [`lapin`],
//! built to hand off messages ("letters") at very high rates without
//! worrying about connection loss, channel multiplexing, broker confirms or
//! retry policy.
//!
//! Applications submit [`Letter`](publishers::Letter)s through a
//! [`Publisher`](publishers::Publisher) - directly, with broker
//! confirmation, or through an internal auto-publish queue - and read the
//! ultimate disposition of every letter from a bounded
//! [`Notifications`](publishers::Notifications) stream. Connections and
//! channels are leased from recovering pools (see the [`pool`] module) that
//! flag and rebuild broken objects transparently.
//!
//! [`Publisher`](publishers::Publisher) is the best starting point to learn
//! what `letterbox` provides and how to leverage it.
//!
//! [`lapin`]: https://docs.rs/crate/lapin

pub mod amqp;
pub mod configuration;
pub mod pool;
pub mod publishers;
pub mod topology;
