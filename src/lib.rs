//! Topic-hierarchical publish/subscribe message bus with a persistent
//! per-topic log. See `SPEC_FULL.md` for the full design.

pub mod cluster;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod kv;
pub mod message;
pub mod partition;
pub mod route;
pub mod router;
pub mod server;
pub mod tree;

pub use error::{Error, Result};
