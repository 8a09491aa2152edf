//! # parley-broker
//!
//! Broker abstraction for the Parley messaging engine.
//!
//! The messaging core needs four primitives from a shared broker:
//!
//! - **Key/value with expiry** - presence markers, delivery receipts
//! - **Sets** - session sets, group membership, pending deliveries
//! - **Pub/sub with patterns** - cross-process live fanout
//! - **Append-only logs** - conversation history with approximate trimming
//!
//! All backends implement the [`Broker`] trait. Commands are batched through a
//! [`Pipeline`] so multi-key reads cost a single round trip.
//!
//! ```rust,ignore
//! use parley_broker::{Broker, BrokerExt, MemoryBroker, Pipeline};
//!
//! let broker = MemoryBroker::new();
//! let mut pipe = Pipeline::new();
//! pipe.sadd("users:online", "alice").exists("user:online:alice");
//! let replies = broker.execute(pipe).await?;
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
pub use traits::{
    bounded, Broker, BrokerError, BrokerExt, Command, LogEntry, PatternMessage, Pipeline, Reply,
    Subscription,
};

#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisConfig};
