//! Core types shared by the `redlink` client crates.
//!
//! This crate holds the pieces that do not touch the network: the error
//! type, the RESP reply model, connection and cluster configuration, and
//! node addressing.

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{
    ClusterConfig, ReadNodePicker, ReconnectDecision, RedisConfig, RetryStrategy, ScaleReads,
    SentinelOptions,
};
pub use error::{RedisError, RedisResult, ReplyError, ReplyErrorKind};
pub use types::{NatMap, NodeAddr, NodeRole};
pub use value::Reply;
