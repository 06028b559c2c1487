//! Async RESP client with pipelining, cluster routing and sentinel
//! discovery.
//!
//! `redlink` talks RESP2 to a key/value server over TCP, TLS or a Unix
//! socket. A single [`Client`] owns one connection with a full lifecycle:
//! offline queueing while disconnected, automatic reconnects with a
//! pluggable retry strategy, subscription replay, and monitor mode. A
//! [`ClusterClient`] routes commands across a sharded deployment by hash
//! slot, follows MOVED/ASK redirections, and refreshes its slot map when
//! the topology shifts. Sentinel discovery resolves the current primary
//! for both.
//!
//! # Quick start
//!
//! ```no_run
//! use redlink::{Client, Commander, RedisConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect(RedisConfig::new("127.0.0.1", 6379)).await?;
//!     client.set("greeting", "hello").await?;
//!     let value = client.get("greeting").await?;
//!     assert_eq!(value.as_deref(), Some("hello"));
//!     Ok(())
//! }
//! ```
//!
//! # Pipelines and transactions
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use redlink::{Client, RedisConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(Client::new(RedisConfig::new("127.0.0.1", 6379))?);
//! let mut tx = client.multi();
//! tx.set("k", "1").incr("k");
//! let results = tx.exec().await?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod events;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod sentinel;
pub mod slots;
pub mod subscription;

pub use client::{Client, Commander};
pub use cluster::ClusterClient;
pub use command::{Command, CommandFlags, KeyExtractor, ReplyEncoding};
pub use connection::{Connection, MessageStream, PushMessage, Status};
pub use events::{Event, EventSink, NullSink, RecordingSink};
pub use pipeline::{BatchCommand, BatchExecutor, Pipeline};
pub use redlink_core::{
    ClusterConfig, NatMap, NodeAddr, NodeRole, ReadNodePicker, ReconnectDecision, RedisConfig,
    RedisError, RedisResult, Reply, ReplyError, ReplyErrorKind, ScaleReads, SentinelOptions,
};
pub use sentinel::SentinelDiscovery;
pub use slots::{key_slot, SlotMap, SLOT_COUNT};
pub use subscription::{SubscriptionKind, SubscriptionSet};
