//! Error types for client operations.

use std::io;
use thiserror::Error;

use crate::types::NodeAddr;

/// Result type used across the client.
pub type RedisResult<T> = Result<T, RedisError>;

/// Category of a server error reply.
///
/// The cluster router acts on the redirection categories; everything else
/// is surfaced to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyErrorKind {
    /// `MOVED <slot> <host>:<port>` — the slot now lives on another node.
    Moved {
        /// Slot that moved.
        slot: u16,
        /// Node that owns the slot now.
        addr: NodeAddr,
    },
    /// `ASK <slot> <host>:<port>` — one-shot handoff during migration.
    Ask {
        /// Slot being migrated.
        slot: u16,
        /// Node to ask.
        addr: NodeAddr,
    },
    /// `TRYAGAIN` — multi-key operation during resharding, retry later.
    TryAgain,
    /// `CLUSTERDOWN` — the cluster cannot serve the slot right now.
    ClusterDown,
    /// `NOSCRIPT` — script not loaded on the node.
    NoScript,
    /// `EXECABORT` — transaction discarded because of earlier errors.
    ExecAbort,
    /// `LOADING` — the node is loading its dataset.
    Loading,
    /// Any other error; carries the leading word of the message.
    Generic(String),
}

/// A server-side error reply, categorised by its leading word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    /// Full message as sent by the server.
    pub message: String,
    /// Parsed category.
    pub kind: ReplyErrorKind,
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl ReplyError {
    /// Parse a raw error message into its category.
    #[must_use]
    pub fn parse(message: &str) -> Self {
        let kind = Self::parse_kind(message);
        Self {
            message: message.to_string(),
            kind,
        }
    }

    fn parse_kind(message: &str) -> ReplyErrorKind {
        if let Some(rest) = message.strip_prefix("MOVED ") {
            if let Some((slot, addr)) = Self::parse_redirect_target(rest) {
                return ReplyErrorKind::Moved { slot, addr };
            }
        }
        if let Some(rest) = message.strip_prefix("ASK ") {
            if let Some((slot, addr)) = Self::parse_redirect_target(rest) {
                return ReplyErrorKind::Ask { slot, addr };
            }
        }
        let name = message
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match name.as_str() {
            "TRYAGAIN" => ReplyErrorKind::TryAgain,
            "CLUSTERDOWN" => ReplyErrorKind::ClusterDown,
            "NOSCRIPT" => ReplyErrorKind::NoScript,
            "EXECABORT" => ReplyErrorKind::ExecAbort,
            "LOADING" => ReplyErrorKind::Loading,
            _ => ReplyErrorKind::Generic(name),
        }
    }

    fn parse_redirect_target(rest: &str) -> Option<(u16, NodeAddr)> {
        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let addr = NodeAddr::parse(parts.next()?)?;
        Some((slot, addr))
    }

    /// True for MOVED and ASK.
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(
            self.kind,
            ReplyErrorKind::Moved { .. } | ReplyErrorKind::Ask { .. }
        )
    }

    /// The redirect target, when this is MOVED or ASK.
    #[must_use]
    pub fn redirect_target(&self) -> Option<&NodeAddr> {
        match &self.kind {
            ReplyErrorKind::Moved { addr, .. } | ReplyErrorKind::Ask { addr, .. } => Some(addr),
            _ => None,
        }
    }
}

/// Error type for all client operations.
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed RESP on the wire; fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Reply(ReplyError),

    /// The command found no writable stream, or the stream ended while the
    /// command was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connect phase did not finish within `connect_timeout`.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The per-request retry cap was reached while reconnecting.
    #[error("reached the retry limit while the connection was down")]
    MaxRetries,

    /// A command was redirected more times than `max_redirections` allows.
    #[error("too many cluster redirections")]
    MaxRedirections,

    /// A batch contained keys hashing to more than one slot.
    #[error("keys in the batch hash to different slots")]
    CrossSlot,

    /// A user-defined command was used inside a cluster pipeline.
    #[error("custom commands cannot be used in a cluster pipeline")]
    CustomInPipeline,

    /// The connection is in subscriber mode and the command is not allowed.
    #[error("connection in subscriber mode, only (p)subscribe / (p)unsubscribe / ping / quit are allowed")]
    SubscriberMode,

    /// The connection is in monitor mode and the command is not allowed.
    #[error("connection in monitor mode")]
    MonitorMode,

    /// The connection is not ready and the offline queue is disabled.
    #[error("stream is not writable and the offline queue is disabled")]
    NotWritable,

    /// No cluster node could be reached; carries the last node error.
    #[error("all cluster nodes failed: {0}")]
    ClusterAllFailed(String),

    /// Unrecoverable abort.
    #[error("aborted: {0}")]
    Abort(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Sentinel discovery failed.
    #[error("sentinel error: {0}")]
    Sentinel(String),

    /// A reply could not be converted to the requested type.
    #[error("type error: {0}")]
    Type(String),
}

impl RedisError {
    /// Wrap a raw server error message.
    #[must_use]
    pub fn reply(message: &str) -> Self {
        Self::Reply(ReplyError::parse(message))
    }

    /// The reply-error category, if this is a server error.
    #[must_use]
    pub fn reply_kind(&self) -> Option<&ReplyErrorKind> {
        match self {
            Self::Reply(e) => Some(&e.kind),
            _ => None,
        }
    }

    /// True when the cluster router may transparently retry after this
    /// error: redirections, resharding hints, and lost connections.
    #[must_use]
    pub fn is_cluster_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Reply(e) => matches!(
                e.kind,
                ReplyErrorKind::Moved { .. }
                    | ReplyErrorKind::Ask { .. }
                    | ReplyErrorKind::TryAgain
                    | ReplyErrorKind::ClusterDown
            ),
            _ => false,
        }
    }

    /// Identity used by the batch retry analysis: two errors are the same
    /// failure when their kind and message agree.
    #[must_use]
    pub fn same_failure(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ConnectionClosed, Self::ConnectionClosed) => true,
            (Self::Reply(a), Self::Reply(b)) => a.message == b.message,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moved() {
        let err = ReplyError::parse("MOVED 12539 10.0.0.4:6380");
        match err.kind {
            ReplyErrorKind::Moved { slot, ref addr } => {
                assert_eq!(slot, 12539);
                assert_eq!(addr.host, "10.0.0.4");
                assert_eq!(addr.port, 6380);
            }
            _ => panic!("expected MOVED, got {:?}", err.kind),
        }
        assert!(err.is_redirect());
    }

    #[test]
    fn parses_ask() {
        let err = ReplyError::parse("ASK 7 [::1]:7001");
        match err.kind {
            ReplyErrorKind::Ask { slot, ref addr } => {
                assert_eq!(slot, 7);
                assert_eq!(addr.host, "::1");
                assert_eq!(addr.port, 7001);
            }
            _ => panic!("expected ASK, got {:?}", err.kind),
        }
    }

    #[test]
    fn malformed_redirect_falls_back_to_generic() {
        let err = ReplyError::parse("MOVED notaslot somewhere");
        assert_eq!(err.kind, ReplyErrorKind::Generic("MOVED".to_string()));
        assert!(!err.is_redirect());
    }

    #[test]
    fn categorises_cluster_errors() {
        assert_eq!(
            ReplyError::parse("TRYAGAIN Multiple keys request during rehashing").kind,
            ReplyErrorKind::TryAgain
        );
        assert_eq!(
            ReplyError::parse("CLUSTERDOWN The cluster is down").kind,
            ReplyErrorKind::ClusterDown
        );
        assert_eq!(
            ReplyError::parse("EXECABORT Transaction discarded").kind,
            ReplyErrorKind::ExecAbort
        );
        assert_eq!(
            ReplyError::parse("ERR unknown command").kind,
            ReplyErrorKind::Generic("ERR".to_string())
        );
    }

    #[test]
    fn same_failure_compares_messages() {
        let a = RedisError::reply("MOVED 1 n:1");
        let b = RedisError::reply("MOVED 1 n:1");
        let c = RedisError::reply("MOVED 2 n:2");
        assert!(a.same_failure(&b));
        assert!(!a.same_failure(&c));
        assert!(RedisError::ConnectionClosed.same_failure(&RedisError::ConnectionClosed));
        assert!(!a.same_failure(&RedisError::ConnectionClosed));
    }
}
