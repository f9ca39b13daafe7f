//! peerbus - embeddable event bus
//!
//! An in-process pub/sub dispatcher whose delivery can be extended, through a
//! pluggable transport, into a mesh of cooperating processes connected by
//! Unix domain sockets.

pub mod bus;
pub mod config;
pub mod id;
pub mod message;
pub mod transport;
pub mod utils;

pub use bus::{Bus, BusBuilder, BusError, Completion, Subscription};
pub use message::{Headers, Message};
