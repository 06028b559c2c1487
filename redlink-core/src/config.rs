//! Connection and cluster configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ReplyError;
use crate::types::{NatMap, NodeAddr, NodeRole};

/// Reconnect delay policy: maps the attempt counter (starting at 1) to the
/// delay before the next attempt. `None` ends the connection; a zero delay
/// means "reconnect on the next tick".
pub type RetryStrategy = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

/// What to do when a reply error matches the caller's reconnect predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Leave the connection alone.
    No,
    /// Disconnect and fail the command.
    Reconnect,
    /// Disconnect and resend the command once reconnected.
    ReconnectAndResend,
}

/// Predicate consulted on every error reply.
pub type ReconnectOnError = Arc<dyn Fn(&ReplyError) -> ReconnectDecision + Send + Sync>;

/// Caller-supplied readiness gate over the parsed `INFO` fields. Returning
/// `false` disconnects with a reconnect.
pub type ReadyCheckHook = Arc<dyn Fn(&HashMap<String, String>) -> bool + Send + Sync>;

/// Caller-supplied read-routing picker for [`ScaleReads::Custom`]: given
/// the slot's candidate nodes (primary first, replicas after) and the
/// lowercased command name, returns the node the command should go to.
pub type ReadNodePicker = Arc<dyn Fn(&[NodeAddr], &str) -> NodeAddr + Send + Sync>;

/// Replica read policy for cluster mode.
#[derive(Clone, Default)]
pub enum ScaleReads {
    /// All reads go to primaries.
    #[default]
    Master,
    /// Read-only commands go to replicas.
    Slave,
    /// Read-only commands go to any node of the slot.
    All,
    /// Read-only commands go to whichever node the picker returns.
    Custom(ReadNodePicker),
}

impl fmt::Debug for ScaleReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("Master"),
            Self::Slave => f.write_str("Slave"),
            Self::All => f.write_str("All"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Sentinel discovery settings.
#[derive(Clone)]
pub struct SentinelOptions {
    /// Ordered observer addresses, tried in turn.
    pub sentinels: Vec<NodeAddr>,
    /// Monitored service name.
    pub name: String,
    /// Whether to resolve the primary or a replica.
    pub role: NodeRole,
    /// Backoff between full passes over the list; `None` falls back to the
    /// connection retry strategy.
    pub sentinel_retry_strategy: Option<RetryStrategy>,
    /// Address translation for NAT setups.
    pub nat_map: Option<NatMap>,
    /// Merge newly gossiped sentinels into the list.
    pub update_sentinels: bool,
    /// Use TLS when talking to the sentinels themselves.
    pub enable_tls_for_sentinel_mode: bool,
}

impl SentinelOptions {
    /// Discovery of the primary for `name` through `sentinels`.
    #[must_use]
    pub fn new(name: impl Into<String>, sentinels: Vec<NodeAddr>) -> Self {
        Self {
            sentinels,
            name: name.into(),
            role: NodeRole::Primary,
            sentinel_retry_strategy: None,
            nat_map: None,
            update_sentinels: false,
            enable_tls_for_sentinel_mode: false,
        }
    }

    /// Resolve a replica instead of the primary.
    #[must_use]
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    /// Rewrite discovered addresses through a NAT map.
    #[must_use]
    pub fn with_nat_map(mut self, nat: NatMap) -> Self {
        self.nat_map = Some(nat);
        self
    }

    /// Merge sentinels learned from `SENTINEL sentinels` replies.
    #[must_use]
    pub fn with_update_sentinels(mut self, update: bool) -> Self {
        self.update_sentinels = update;
        self
    }

    /// Backoff applied after a full unsuccessful pass.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.sentinel_retry_strategy = Some(strategy);
        self
    }
}

impl fmt::Debug for SentinelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelOptions")
            .field("sentinels", &self.sentinels)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("update_sentinels", &self.update_sentinels)
            .finish_non_exhaustive()
    }
}

/// Configuration for a single connection.
#[derive(Clone)]
pub struct RedisConfig {
    /// Server hostname or IP.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Unix socket path; takes precedence over host/port when set.
    pub path: Option<PathBuf>,
    /// Wrap the stream in TLS.
    pub tls: bool,
    /// `AUTH` at ready.
    pub password: Option<String>,
    /// `SELECT` at ready.
    pub db: u32,
    /// `CLIENT SETNAME` at ready.
    pub connection_name: Option<String>,
    /// TCP keepalive interval.
    pub keep_alive: Option<Duration>,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Upper bound on the connect phase.
    pub connect_timeout: Duration,
    /// Reconnect delay policy.
    pub retry_strategy: RetryStrategy,
    /// Flush queued commands with `MaxRetries` every `cap + 1` attempts.
    pub max_retries_per_request: Option<u32>,
    /// Predicate deciding whether an error reply forces a reconnect.
    pub reconnect_on_error: Option<ReconnectOnError>,
    /// Queue commands while the connection is not ready.
    pub enable_offline_queue: bool,
    /// Gate readiness on `INFO` loading state.
    pub enable_ready_check: bool,
    /// Extra caller predicate over the parsed `INFO` reply.
    pub ready_check: Option<ReadyCheckHook>,
    /// Upper bound on a single loading-eta wait.
    pub max_loading_retry_time: Duration,
    /// Start in `wait` and connect on first use.
    pub lazy_connect: bool,
    /// Replay the subscription set after a reconnect.
    pub auto_resubscribe: bool,
    /// Resend commands that were in flight when the stream ended.
    pub auto_resend_unfulfilled_commands: bool,
    /// Issue `READONLY` at ready (replica read mode).
    pub read_only: bool,
    /// Surface integers beyond +/-2^53 as strings.
    pub stringify_numbers: bool,
    /// Prefix applied to every key argument.
    pub key_prefix: Option<String>,
    /// Capture the submission backtrace and attach it to reply errors.
    pub show_friendly_error_stack: bool,
    /// Discover the server through sentinels instead of host/port.
    pub sentinel: Option<SentinelOptions>,
}

/// Default reconnect policy: 50ms per attempt, capped at 2 seconds.
#[must_use]
pub fn default_retry_strategy() -> RetryStrategy {
    Arc::new(|attempt| Some(Duration::from_millis(u64::from(attempt.min(40)) * 50)))
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            path: None,
            tls: false,
            password: None,
            db: 0,
            connection_name: None,
            keep_alive: None,
            no_delay: true,
            connect_timeout: Duration::from_secs(10),
            retry_strategy: default_retry_strategy(),
            max_retries_per_request: Some(20),
            reconnect_on_error: None,
            enable_offline_queue: true,
            enable_ready_check: true,
            ready_check: None,
            max_loading_retry_time: Duration::from_secs(10),
            lazy_connect: false,
            auto_resubscribe: true,
            auto_resend_unfulfilled_commands: true,
            read_only: false,
            stringify_numbers: false,
            key_prefix: None,
            show_friendly_error_stack: false,
            sentinel: None,
        }
    }
}

impl RedisConfig {
    /// Configuration for `host:port` with everything else at defaults.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Address this configuration points at.
    #[must_use]
    pub fn addr(&self) -> NodeAddr {
        NodeAddr::new(self.host.clone(), self.port)
    }

    /// Re-target the configuration at another node, keeping every policy.
    #[must_use]
    pub fn for_node(&self, addr: &NodeAddr) -> Self {
        let mut config = self.clone();
        config.host = addr.host.clone();
        config.port = addr.port;
        config.path = None;
        config.sentinel = None;
        config
    }

    /// Set the password sent with `AUTH`.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the logical database selected at ready.
    #[must_use]
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Connect over a Unix socket instead of TCP.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enable TLS on the stream.
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Name announced with `CLIENT SETNAME`.
    #[must_use]
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Bound the connect phase.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replace the reconnect delay policy.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Cap reconnect attempts per queued command.
    #[must_use]
    pub fn with_max_retries_per_request(mut self, cap: Option<u32>) -> Self {
        self.max_retries_per_request = cap;
        self
    }

    /// Install a reconnect-on-error predicate.
    #[must_use]
    pub fn with_reconnect_on_error(mut self, hook: ReconnectOnError) -> Self {
        self.reconnect_on_error = Some(hook);
        self
    }

    /// Toggle the offline queue.
    #[must_use]
    pub fn with_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    /// Toggle the `INFO` ready check.
    #[must_use]
    pub fn with_ready_check(mut self, enabled: bool) -> Self {
        self.enable_ready_check = enabled;
        self
    }

    /// Defer connecting until the first command.
    #[must_use]
    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Enter replica read mode at ready.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Surface out-of-range integers as strings.
    #[must_use]
    pub fn with_stringify_numbers(mut self, stringify: bool) -> Self {
        self.stringify_numbers = stringify;
        self
    }

    /// Prefix every key argument.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Discover the server through sentinels.
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: SentinelOptions) -> Self {
        self.sentinel = Some(sentinel);
        self
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("tls", &self.tls)
            .field("db", &self.db)
            .field("connect_timeout", &self.connect_timeout)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("enable_ready_check", &self.enable_ready_check)
            .field("lazy_connect", &self.lazy_connect)
            .field("read_only", &self.read_only)
            .field("sentinel", &self.sentinel)
            .finish_non_exhaustive()
    }
}

/// Configuration for cluster mode.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Seed nodes tried at boot.
    pub seeds: Vec<NodeAddr>,
    /// Per-node connection template; host/port are overridden per node.
    pub redis: RedisConfig,
    /// Replica read policy.
    pub scale_reads: ScaleReads,
    /// Redirections a command may follow before failing.
    pub max_redirections: u32,
    /// Pause before re-dispatch after MOVED.
    pub retry_delay_on_moved: Duration,
    /// Pause before retry after TRYAGAIN or CLUSTERDOWN.
    pub retry_delay_on_try_again: Duration,
    /// Periodic slot-map refresh; `None` refreshes only on redirects.
    pub slots_refresh_interval: Option<Duration>,
    /// Upper bound on one `CLUSTER SLOTS` exchange.
    pub slots_refresh_timeout: Duration,
    /// Rewrite addresses announced in `CLUSTER SLOTS` replies.
    pub nat_map: Option<NatMap>,
}

impl ClusterConfig {
    /// Cluster reachable through `seeds`, with default policies.
    #[must_use]
    pub fn new(seeds: Vec<NodeAddr>) -> Self {
        Self {
            seeds,
            redis: RedisConfig::default(),
            scale_reads: ScaleReads::default(),
            max_redirections: 16,
            retry_delay_on_moved: Duration::ZERO,
            retry_delay_on_try_again: Duration::from_millis(100),
            slots_refresh_interval: None,
            slots_refresh_timeout: Duration::from_secs(1),
            nat_map: None,
        }
    }

    /// Replace the per-node connection template.
    #[must_use]
    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.redis = redis;
        self
    }

    /// Set the replica read policy.
    #[must_use]
    pub fn with_scale_reads(mut self, scale_reads: ScaleReads) -> Self {
        self.scale_reads = scale_reads;
        self
    }

    /// Cap redirections per command.
    #[must_use]
    pub fn with_max_redirections(mut self, max: u32) -> Self {
        self.max_redirections = max;
        self
    }

    /// Refresh the slot map on a timer as well as on redirects.
    #[must_use]
    pub fn with_slots_refresh_interval(mut self, interval: Duration) -> Self {
        self.slots_refresh_interval = Some(interval);
        self
    }
}
