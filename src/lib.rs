//! This crate wires a broadcast topic to a durable queue and consumes the queue with a polling subscriber.
//! The broker itself is reached through [`broker::BrokerApi`]; [`memory::MemoryBroker`] runs everything in-process.
pub mod broker;
pub mod config;
pub mod error;
pub mod exchange;
pub mod mediator;
pub mod memory;
pub mod message;
pub mod naming;
pub mod policy;
pub mod subscriber;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ClientConfig;
pub use error::{ClientError, HandlerError};
pub use exchange::Exchange;
pub use mediator::Mediator;
pub use message::Message;
pub use subscriber::{MessageHandler, MessageSource, Subscriber};
pub use subscription::{FilterPolicy, SubscriptionAttribute, SubscriptionContext};
