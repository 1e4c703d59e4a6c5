#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod hooks;
mod keepalive;
pub mod message;
pub mod replay;
pub mod subscription;
pub mod transport;

pub use config::{Config, ReconnectConfig};
pub use connector::{Connector, ConnectorState, MetaListener};
pub use error::Error;
pub use message::{MetaMessage, PayloadFormat, TopicEvent};
pub use replay::{REPLAY_FROM_EARLIEST, REPLAY_FROM_TIP};
pub use subscription::{EventConsumer, Subscription};

pub type Result<T> = std::result::Result<T, Error>;
