//! # Messaging Module
//!
//! Notifications between the queue controller, dispatchers and downstream
//! controllers. The controller only depends on [`MessageQueue`]; the
//! in-memory transport backs tests and the pgmq transport backs production.

pub mod in_memory;
pub mod message;
#[cfg(feature = "postgres")]
pub mod pgmq;
pub mod queues;
pub mod transport;

pub use in_memory::InMemoryMessageQueue;
pub use message::*;
#[cfg(feature = "postgres")]
pub use pgmq::PgmqMessageQueue;
pub use queues::QueueType;
pub use transport::{handler_fn, MessageHandler, MessageQueue, Subscription};
