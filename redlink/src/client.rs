//! The single-connection client and the shared commander surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use redlink_core::{RedisConfig, RedisError, RedisResult, Reply};
use tokio::sync::mpsc;

use crate::command::{arg, Command};
use crate::connection::{Connection, PushMessage, PushStreams, StaticResolver, Status};
use crate::events::{EventSink, NullSink};
use crate::pipeline::{BatchCommand, BatchExecutor, Pipeline};
use crate::sentinel::SentinelResolver;

/// The command surface shared by [`Client`] and
/// [`crate::cluster::ClusterClient`].
///
/// `call` is the universal entry point; the typed helpers below are thin
/// wrappers over it.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Submit one command and await its decoded reply.
    async fn call(&self, name: &str, args: Vec<Bytes>) -> RedisResult<Reply>;

    /// `GET key`, `None` for a missing key.
    async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        self.call("get", vec![arg(key)]).await?.try_into()
    }

    /// `GET key` as raw bytes.
    async fn get_buffer(&self, key: &str) -> RedisResult<Option<Bytes>> {
        match self.call("get", vec![arg(key)]).await? {
            Reply::Null => Ok(None),
            other => other.into_bytes().map(Some),
        }
    }

    /// `SET key value`.
    async fn set(&self, key: &str, value: impl AsRef<[u8]> + Send) -> RedisResult<()> {
        self.call("set", vec![arg(key), arg(value)]).await.map(|_| ())
    }

    /// `DEL key...`, returning the number of removed keys.
    async fn del(&self, keys: &[&str]) -> RedisResult<i64> {
        self.call("del", keys.iter().map(|k| arg(k)).collect())
            .await?
            .as_int()
    }

    /// `INCR key`.
    async fn incr(&self, key: &str) -> RedisResult<i64> {
        self.call("incr", vec![arg(key)]).await?.as_int()
    }

    /// `EXISTS key...`.
    async fn exists(&self, keys: &[&str]) -> RedisResult<i64> {
        self.call("exists", keys.iter().map(|k| arg(k)).collect())
            .await?
            .as_int()
    }

    /// `TTL key` in seconds.
    async fn ttl(&self, key: &str) -> RedisResult<i64> {
        self.call("ttl", vec![arg(key)]).await?.as_int()
    }

    /// `HSET key field value`.
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: impl AsRef<[u8]> + Send,
    ) -> RedisResult<i64> {
        self.call("hset", vec![arg(key), arg(field), arg(value)])
            .await?
            .as_int()
    }

    /// `HGET key field`.
    async fn hget(&self, key: &str, field: &str) -> RedisResult<Option<String>> {
        self.call("hget", vec![arg(key), arg(field)]).await?.try_into()
    }

    /// `HGETALL key` as field/value pairs.
    async fn hgetall(&self, key: &str) -> RedisResult<Vec<(String, String)>> {
        let entries = self.call("hgetall", vec![arg(key)]).await?.into_map()?;
        entries
            .into_iter()
            .map(|(f, v)| Ok((f.into_string()?, v.into_string()?)))
            .collect()
    }

    /// `PUBLISH channel payload`, returning the receiver count.
    async fn publish(&self, channel: &str, payload: impl AsRef<[u8]> + Send) -> RedisResult<i64> {
        self.call("publish", vec![arg(channel), arg(payload)])
            .await?
            .as_int()
    }

    /// `PING`.
    async fn ping(&self) -> RedisResult<String> {
        self.call("ping", Vec::new()).await?.into_string()
    }

    /// `INFO`, parsed into its fields.
    async fn info(&self) -> RedisResult<Vec<(String, String)>> {
        let entries = self.call("info", Vec::new()).await?.into_map()?;
        entries
            .into_iter()
            .map(|(f, v)| Ok((f.into_string()?, v.into_string()?)))
            .collect()
    }
}

/// Client over one connection (plus whatever the connection does on its
/// own: reconnects, offline queueing, subscription replay).
pub struct Client {
    config: RedisConfig,
    sink: Arc<dyn EventSink>,
    conn: Connection,
    messages: Mutex<Option<mpsc::UnboundedReceiver<PushMessage>>>,
    monitor: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    custom: RwLock<HashMap<String, Option<usize>>>,
}

impl Client {
    /// Spawn the connection task and return the client immediately; with
    /// `lazy_connect` the dial is deferred to the first command.
    pub fn new(config: RedisConfig) -> RedisResult<Self> {
        Self::with_sink(config, Arc::new(NullSink))
    }

    /// Like [`Client::new`], with a caller-supplied event sink.
    pub fn with_sink(config: RedisConfig, sink: Arc<dyn EventSink>) -> RedisResult<Self> {
        let resolver = if config.sentinel.is_some() {
            SentinelResolver::from_config(&config)?
        } else {
            StaticResolver::from_config(&config)
        };
        let (conn, streams) =
            Connection::spawn_with_resolver(config.clone(), resolver, sink.clone());
        let PushStreams { messages, monitor } = streams;
        Ok(Self {
            config,
            sink,
            conn,
            messages: Mutex::new(Some(messages)),
            monitor: Mutex::new(Some(monitor)),
            custom: RwLock::new(HashMap::new()),
        })
    }

    /// Spawn and wait until the connection is ready.
    pub async fn connect(config: RedisConfig) -> RedisResult<Self> {
        let client = Self::new(config)?;
        client.conn.wait_ready().await?;
        Ok(client)
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.conn.status()
    }

    /// Explicitly connect (used with `lazy_connect` or after `end`).
    pub fn reconnect(&self) {
        self.conn.connect();
    }

    /// Close the stream. With `reconnect` the retry cycle starts
    /// immediately; without it the connection goes to `end`.
    pub fn disconnect(&self, reconnect: bool) {
        self.conn.disconnect(reconnect);
    }

    /// Graceful shutdown with `QUIT`.
    pub async fn quit(&self) -> RedisResult<()> {
        self.call("quit", Vec::new()).await.map(|_| ())
    }

    /// Wait until the connection is ready.
    pub async fn wait_ready(&self) -> RedisResult<()> {
        self.conn.wait_ready().await
    }

    /// Register a custom command so `call` classifies it and clusters can
    /// route it. `num_keys: None` means the key count is passed as the
    /// command's first argument.
    pub fn define_command(&self, name: &str, num_keys: Option<usize>) {
        self.custom
            .write()
            .expect("registry poisoned")
            .insert(name.to_ascii_lowercase(), num_keys);
    }

    /// A fresh client with the same configuration (and a fresh
    /// connection), optionally adjusted.
    pub fn duplicate(
        &self,
        overrides: impl FnOnce(RedisConfig) -> RedisConfig,
    ) -> RedisResult<Self> {
        Self::with_sink(overrides(self.config.clone()), self.sink.clone())
    }

    /// Batch without transaction semantics.
    #[must_use]
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        let executor: Arc<dyn BatchExecutor> = self.clone();
        Pipeline::new(executor, false).with_key_prefix(self.config.key_prefix.clone())
    }

    /// `MULTI`/`EXEC` transaction.
    #[must_use]
    pub fn multi(self: &Arc<Self>) -> Pipeline {
        let executor: Arc<dyn BatchExecutor> = self.clone();
        Pipeline::new(executor, true).with_key_prefix(self.config.key_prefix.clone())
    }

    /// Subscribe to channels; messages arrive on [`Client::messages`].
    pub async fn subscribe(&self, channels: &[&str]) -> RedisResult<()> {
        self.call("subscribe", channels.iter().map(|c| arg(c)).collect())
            .await
            .map(|_| ())
    }

    /// Subscribe to patterns.
    pub async fn psubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        self.call("psubscribe", patterns.iter().map(|p| arg(p)).collect())
            .await
            .map(|_| ())
    }

    /// Unsubscribe from channels (all of them when empty).
    pub async fn unsubscribe(&self, channels: &[&str]) -> RedisResult<()> {
        self.call("unsubscribe", channels.iter().map(|c| arg(c)).collect())
            .await
            .map(|_| ())
    }

    /// Unsubscribe from patterns (all of them when empty).
    pub async fn punsubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        self.call("punsubscribe", patterns.iter().map(|p| arg(p)).collect())
            .await
            .map(|_| ())
    }

    /// Take the pub/sub message stream. Yields `None` after the first
    /// call: one consumer owns the stream.
    #[must_use]
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<PushMessage>> {
        self.messages.lock().expect("stream lock poisoned").take()
    }

    /// Like [`Client::messages`], wrapped as a `futures_util::Stream`.
    #[must_use]
    pub fn message_stream(&self) -> Option<crate::connection::MessageStream> {
        self.messages().map(crate::connection::MessageStream::new)
    }

    /// Enter monitor mode and take the stream of monitor lines.
    pub async fn monitor(&self) -> RedisResult<mpsc::UnboundedReceiver<String>> {
        self.call("monitor", Vec::new()).await?;
        self.monitor
            .lock()
            .expect("stream lock poisoned")
            .take()
            .ok_or_else(|| RedisError::Abort("monitor stream already taken".to_string()))
    }

    fn build_command(&self, name: &str, args: Vec<Bytes>) -> (Command, crate::command::ReplyReceiver) {
        let lowered = name.to_ascii_lowercase();
        let registered = self
            .custom
            .read()
            .expect("registry poisoned")
            .get(&lowered)
            .copied();
        let (mut cmd, rx) = match registered {
            Some(num_keys) => Command::custom(&lowered, args, num_keys),
            None => Command::new(&lowered, args),
        };
        if let Some(prefix) = &self.config.key_prefix {
            cmd.apply_key_prefix(prefix);
        }
        cmd.db = self.config.db;
        if self.config.show_friendly_error_stack {
            cmd.trace = Some(std::backtrace::Backtrace::force_capture().to_string());
        }
        (cmd, rx)
    }
}

#[async_trait]
impl Commander for Client {
    async fn call(&self, name: &str, args: Vec<Bytes>) -> RedisResult<Reply> {
        let (cmd, rx) = self.build_command(name, args);
        self.conn.send(cmd);
        rx.await.unwrap_or(Err(RedisError::ConnectionClosed))
    }
}

#[async_trait]
impl BatchExecutor for Client {
    /// Submit the batch over the connection in one buffered write; the
    /// in-flight FIFO binds the replies positionally.
    async fn execute(&self, batch: Vec<BatchCommand>) -> RedisResult<Vec<RedisResult<Reply>>> {
        let mut cmds = Vec::with_capacity(batch.len());
        let mut receivers = Vec::with_capacity(batch.len());
        for desc in &batch {
            let (mut cmd, rx) = desc.to_command();
            cmd.db = self.config.db;
            cmds.push(cmd);
            receivers.push(rx);
        }
        self.conn.send_batch(cmds);
        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(rx.await.unwrap_or(Err(RedisError::ConnectionClosed)));
        }
        Ok(results)
    }
}

#[async_trait]
impl Commander for crate::cluster::ClusterClient {
    async fn call(&self, name: &str, args: Vec<Bytes>) -> RedisResult<Reply> {
        let mut desc = BatchCommand::new(name, args);
        if let Some(prefix) = self.key_prefix() {
            desc.apply_key_prefix(&prefix);
        }
        self.route_command(&desc).await
    }
}
