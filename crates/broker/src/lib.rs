//! Message broker access for the post-processing dispatcher.
//!
//! [`traits`] defines the [`Connector`] / [`Session`] capability the
//! dispatcher is written against. [`client`] implements it with STOMP 1.1
//! over TCP, using the [`frame`] codec and [`failover`] URI handling.

pub mod client;
pub mod error;
pub mod failover;
pub mod frame;
pub mod traits;

pub use client::{StompClient, StompConfig, StompSession};
pub use error::{BrokerError, BrokerResult};
pub use traits::{AckMode, AckToken, Connector, Message, Session, SubscribeOptions};
