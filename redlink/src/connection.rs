//! The connection: one cooperative task owning the stream.
//!
//! Callers hold a cheap [`Connection`] handle and talk to the task over an
//! unbounded channel; every submitted [`Command`] is answered through its
//! own one-shot handle. The task runs the whole lifecycle: connect,
//! handshake, ready check, the in-flight FIFO, the offline queue,
//! subscriber and monitor modes, and the reconnect loop.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use redlink_core::{
    ReconnectDecision, RedisConfig, RedisError, RedisResult, Reply,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::Command;
use crate::events::{Event, EventSink};
use crate::protocol::{encode_command, RespDecoder};
use crate::subscription::{SubscriptionKind, SubscriptionSet};

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Lazy connect configured; waiting for the first command.
    Wait,
    /// Transport handshake in progress.
    Connecting,
    /// Transport up; session handshake in progress.
    Connect,
    /// Commands flow.
    Ready,
    /// `MONITOR` is active.
    Monitoring,
    /// A reconnect is scheduled.
    Reconnecting,
    /// The stream ended; deciding what happens next.
    Close,
    /// No further reconnect attempts.
    End,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::Connecting => "connecting",
            Self::Connect => "connect",
            Self::Ready => "ready",
            Self::Monitoring => "monitoring",
            Self::Reconnecting => "reconnecting",
            Self::Close => "close",
            Self::End => "end",
        };
        f.write_str(s)
    }
}

/// A pub/sub push frame delivered out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
}

/// Out-of-band streams of one connection.
#[derive(Debug)]
pub struct PushStreams {
    /// Pub/sub messages.
    pub messages: mpsc::UnboundedReceiver<PushMessage>,
    /// Monitor-mode lines.
    pub monitor: mpsc::UnboundedReceiver<String>,
}

/// [`futures_util::Stream`] adapter over the pub/sub messages, for callers
/// that consume them combinator-style.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<PushMessage>,
}

impl MessageStream {
    /// Wrap the raw message receiver.
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<PushMessage>) -> Self {
        Self { rx }
    }
}

impl futures_util::Stream for MessageStream {
    type Item = PushMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PushMessage>> {
        self.rx.poll_recv(cx)
    }
}

/// Where the transport should dial.
#[derive(Debug, Clone)]
pub enum ServerTarget {
    /// TCP, optionally wrapped in TLS.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
        /// Wrap the stream in TLS.
        tls: bool,
    },
    /// Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

/// Resolves the address to dial before every connect attempt.
///
/// Static configurations resolve to a constant; sentinel mode re-queries
/// the observers so a reconnect lands on the current primary.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Produce the target for the next connect attempt.
    async fn resolve(&self) -> RedisResult<ServerTarget>;
}

/// Resolver for a fixed host/port or socket path.
pub struct StaticResolver {
    target: ServerTarget,
}

impl StaticResolver {
    /// Target taken from the configuration.
    #[must_use]
    pub fn from_config(config: &RedisConfig) -> Arc<dyn AddressResolver> {
        let target = match &config.path {
            Some(path) => ServerTarget::Unix { path: path.clone() },
            None => ServerTarget::Tcp {
                host: config.host.clone(),
                port: config.port,
                tls: config.tls,
            },
        };
        Arc::new(Self { target })
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self) -> RedisResult<ServerTarget> {
        Ok(self.target.clone())
    }
}

/// The stream, behind one type so the task does not care which transport
/// the configuration picked.
pub enum Transport {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS over TCP.
    Tls(tokio_native_tls::TlsStream<TcpStream>),
    /// Unix domain socket.
    Unix(UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A transport plus its decode buffer. The handshake and the serve loop
/// share this so bytes read early are never lost.
pub(crate) struct Wire {
    pub(crate) transport: Transport,
    pub(crate) decoder: RespDecoder,
}

impl Wire {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport,
            decoder: RespDecoder::new(),
        }
    }

    /// One sequential request/response exchange. Only used while no
    /// pipelined commands are outstanding (handshake, sentinel queries).
    pub(crate) async fn request(&mut self, name: &str, args: &[Bytes]) -> RedisResult<Reply> {
        let mut buf = BytesMut::new();
        encode_command(name, args, &mut buf);
        self.transport.write_all(&buf).await?;
        let reply = self.read_reply().await?;
        match reply {
            Reply::Error(msg) => Err(RedisError::reply(&msg)),
            other => Ok(other),
        }
    }

    /// Read exactly one reply, waiting for more bytes as needed.
    pub(crate) async fn read_reply(&mut self) -> RedisResult<Reply> {
        loop {
            if let Some(reply) = self.decoder.next_reply()? {
                return Ok(reply);
            }
            let n = self.transport.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                return Err(RedisError::ConnectionClosed);
            }
        }
    }
}

/// Dial the resolved target, applying socket options and the connect
/// timeout.
pub(crate) async fn establish(
    config: RedisConfig,
    resolver: Arc<dyn AddressResolver>,
) -> RedisResult<Transport> {
    let target = resolver.resolve().await?;
    match target {
        ServerTarget::Unix { path } => {
            let stream = timeout(config.connect_timeout, UnixStream::connect(&path))
                .await
                .map_err(|_| RedisError::ConnectTimeout)??;
            Ok(Transport::Unix(stream))
        }
        ServerTarget::Tcp { host, port, tls } => {
            let addr = format!("{host}:{port}");
            debug!(%addr, "connecting");
            let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| RedisError::ConnectTimeout)??;
            if config.no_delay {
                stream.set_nodelay(true)?;
            }
            let stream = match config.keep_alive {
                Some(interval) => {
                    let socket = socket2::Socket::from(stream.into_std()?);
                    socket
                        .set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(interval))?;
                    TcpStream::from_std(socket.into())?
                }
                None => stream,
            };
            if tls {
                let connector = native_tls::TlsConnector::new()
                    .map_err(|e| RedisError::Config(format!("tls setup failed: {e}")))?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let stream = timeout(config.connect_timeout, connector.connect(&host, stream))
                    .await
                    .map_err(|_| RedisError::ConnectTimeout)?
                    .map_err(|e| RedisError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
                Ok(Transport::Tls(stream))
            } else {
                Ok(Transport::Tcp(stream))
            }
        }
    }
}

/// Session state replayed across reconnects.
struct SessionSnapshot {
    db: u32,
    channels: Vec<String>,
    patterns: Vec<String>,
    monitoring: bool,
}

/// AUTH, SELECT, SETNAME, READONLY, the ready check, and subscription
/// replay, in that order.
async fn ready_handshake(
    config: RedisConfig,
    mut wire: Wire,
    snapshot: SessionSnapshot,
) -> RedisResult<Wire> {
    if let Some(password) = &config.password {
        wire.request("auth", &[Bytes::copy_from_slice(password.as_bytes())])
            .await?;
    }
    if snapshot.db != 0 {
        wire.request("select", &[Bytes::from(snapshot.db.to_string())])
            .await?;
    }
    if let Some(name) = &config.connection_name {
        wire.request(
            "client",
            &[
                Bytes::from_static(b"setname"),
                Bytes::copy_from_slice(name.as_bytes()),
            ],
        )
        .await?;
    }
    if config.read_only {
        wire.request("readonly", &[]).await?;
    }
    if config.enable_ready_check {
        ready_check(&config, &mut wire).await?;
    }
    if config.auto_resubscribe {
        if !snapshot.channels.is_empty() {
            replay_subscriptions(&mut wire, "subscribe", &snapshot.channels).await?;
        }
        if !snapshot.patterns.is_empty() {
            replay_subscriptions(&mut wire, "psubscribe", &snapshot.patterns).await?;
        }
    }
    if snapshot.monitoring {
        wire.request("monitor", &[]).await?;
    }
    Ok(wire)
}

/// Gate readiness on `INFO` until the server finishes loading.
async fn ready_check(config: &RedisConfig, wire: &mut Wire) -> RedisResult<()> {
    loop {
        let info = wire.request("info", &[]).await?;
        let fields = parse_info_fields(info.as_str().unwrap_or_default());
        let loading = fields.get("loading").is_some_and(|v| v == "1");
        if loading {
            let eta = fields
                .get("loading_eta_seconds")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            let wait = Duration::from_millis(eta.saturating_mul(1000))
                .min(config.max_loading_retry_time);
            debug!(?wait, "server loading, ready check rescheduled");
            tokio::time::sleep(wait).await;
            continue;
        }
        if let Some(hook) = &config.ready_check {
            if !hook(&fields) {
                return Err(RedisError::Abort(
                    "ready check rejected the server".to_string(),
                ));
            }
        }
        return Ok(());
    }
}

/// Parse `INFO` text into its `key:value` fields.
pub(crate) fn parse_info_fields(text: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            fields.insert(k.to_string(), v.to_string());
        }
    }
    fields
}

/// Re-issue one subscribe command and consume its confirmation frames.
async fn replay_subscriptions(
    wire: &mut Wire,
    verb: &str,
    names: &[String],
) -> RedisResult<()> {
    let args: Vec<Bytes> = names
        .iter()
        .map(|c| Bytes::copy_from_slice(c.as_bytes()))
        .collect();
    let mut buf = BytesMut::new();
    encode_command(verb, &args, &mut buf);
    wire.transport.write_all(&buf).await?;
    for _ in 0..names.len() {
        let reply = wire.read_reply().await?;
        if let Reply::Error(msg) = reply {
            return Err(RedisError::reply(&msg));
        }
    }
    Ok(())
}

enum Op {
    Submit(Command),
    SubmitBatch(Vec<Command>),
    Connect,
    Disconnect { reconnect: bool },
}

/// Cheap, cloneable handle to a connection task.
#[derive(Clone)]
pub struct Connection {
    op_tx: mpsc::UnboundedSender<Op>,
    status_rx: watch::Receiver<Status>,
}

impl Connection {
    /// Start the connection task.
    #[must_use]
    pub fn spawn(config: RedisConfig, sink: Arc<dyn EventSink>) -> (Self, PushStreams) {
        let resolver = StaticResolver::from_config(&config);
        Self::spawn_with_resolver(config, resolver, sink)
    }

    /// Start the connection task with a custom address resolver (sentinel
    /// mode re-resolves on every attempt).
    #[must_use]
    pub fn spawn_with_resolver(
        config: RedisConfig,
        resolver: Arc<dyn AddressResolver>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, PushStreams) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let initial = if config.lazy_connect {
            Status::Wait
        } else {
            Status::Connecting
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (mon_tx, mon_rx) = mpsc::unbounded_channel();
        let db = config.db;
        let task = ConnectionTask {
            config,
            resolver,
            sink,
            op_rx,
            status_tx,
            msg_tx,
            mon_tx,
            in_flight: VecDeque::new(),
            offline: VecDeque::new(),
            subs: SubscriptionSet::new(),
            db,
            subscriber_mode: false,
            monitoring: false,
            attempts: 0,
            manually_closing: false,
        };
        tokio::spawn(task.run());
        (
            Self { op_tx, status_rx },
            PushStreams {
                messages: msg_rx,
                monitor: mon_rx,
            },
        )
    }

    /// Submit a command. Its completion handle fires with the reply, or
    /// with `ConnectionClosed` when the task is gone.
    pub fn send(&self, cmd: Command) {
        if let Err(mpsc::error::SendError(op)) = self.op_tx.send(Op::Submit(cmd)) {
            if let Op::Submit(mut cmd) = op {
                cmd.complete(Err(RedisError::ConnectionClosed));
            }
        }
    }

    /// Submit a batch: serialised into one buffer and flushed once, with
    /// replies bound positionally by the in-flight FIFO.
    pub fn send_batch(&self, cmds: Vec<Command>) {
        if let Err(mpsc::error::SendError(op)) = self.op_tx.send(Op::SubmitBatch(cmds)) {
            if let Op::SubmitBatch(cmds) = op {
                for mut cmd in cmds {
                    cmd.complete(Err(RedisError::ConnectionClosed));
                }
            }
        }
    }

    /// Leave `wait`/`end` and connect.
    pub fn connect(&self) {
        let _ = self.op_tx.send(Op::Connect);
    }

    /// Close the stream. With `reconnect` the usual retry cycle starts
    /// immediately; without it the connection goes to `end`.
    pub fn disconnect(&self, reconnect: bool) {
        let _ = self.op_tx.send(Op::Disconnect { reconnect });
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    /// Wait until the connection is ready (or monitoring), failing fast
    /// when it reaches `end`.
    pub async fn wait_ready(&self) -> RedisResult<()> {
        let mut rx = self.status_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                Status::Ready | Status::Monitoring => return Ok(()),
                Status::End => return Err(RedisError::ConnectionClosed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(RedisError::ConnectionClosed);
            }
        }
    }

    /// Wait until the connection reaches `end` (or the task is gone).
    pub async fn wait_end(&self) {
        let mut rx = self.status_rx.clone();
        loop {
            if *rx.borrow_and_update() == Status::End {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct InFlight {
    cmd: Command,
    /// Confirmation frames still expected for subscribe-family commands.
    expected_subs: usize,
    /// The reconnect-on-error hook asked for this command to be resent
    /// even when automatic resend is disabled.
    force_resend: bool,
}

enum Exit {
    /// The handle side hung up; the task ends.
    Dropped,
    /// User-initiated close.
    Manual { reconnect: bool },
    /// The stream failed or ended.
    Stream(RedisError),
}

const PUSH_KINDS: [&str; 6] = [
    "message",
    "pmessage",
    "subscribe",
    "unsubscribe",
    "psubscribe",
    "punsubscribe",
];

struct ConnectionTask {
    config: RedisConfig,
    resolver: Arc<dyn AddressResolver>,
    sink: Arc<dyn EventSink>,
    op_rx: mpsc::UnboundedReceiver<Op>,
    status_tx: watch::Sender<Status>,
    msg_tx: mpsc::UnboundedSender<PushMessage>,
    mon_tx: mpsc::UnboundedSender<String>,
    in_flight: VecDeque<InFlight>,
    offline: VecDeque<Command>,
    subs: SubscriptionSet,
    db: u32,
    subscriber_mode: bool,
    monitoring: bool,
    attempts: u32,
    manually_closing: bool,
}

impl ConnectionTask {
    fn set_status(&self, status: Status) {
        self.status_tx.send_replace(status);
    }

    async fn run(mut self) {
        let mut idle_status = Status::Wait;
        let mut want_connect = !self.config.lazy_connect;
        loop {
            if !want_connect {
                self.set_status(idle_status);
                match self.op_rx.recv().await {
                    None => {
                        self.fail_everything();
                        return;
                    }
                    Some(Op::Connect) => {}
                    Some(Op::Submit(cmd)) => {
                        if idle_status == Status::End {
                            let mut cmd = cmd;
                            cmd.complete(Err(RedisError::ConnectionClosed));
                            continue;
                        }
                        self.enqueue_offline(cmd);
                    }
                    Some(Op::SubmitBatch(cmds)) => {
                        if idle_status == Status::End {
                            for mut cmd in cmds {
                                cmd.complete(Err(RedisError::ConnectionClosed));
                            }
                            continue;
                        }
                        for cmd in cmds {
                            self.enqueue_offline(cmd);
                        }
                    }
                    Some(Op::Disconnect { .. }) => continue,
                }
            }
            self.manually_closing = false;
            if self.connect_cycle().await {
                return;
            }
            // Reached `end`; stay alive so connect() can restart us.
            idle_status = Status::End;
            want_connect = false;
        }
    }

    /// Connect, serve, and retry until the strategy declines or the user
    /// closes. Returns `true` when the task should exit entirely.
    async fn connect_cycle(&mut self) -> bool {
        loop {
            self.set_status(Status::Connecting);
            self.sink.emit(Event::Connecting);
            let exit = self.attempt().await;
            self.set_status(Status::Close);
            self.sink.emit(Event::Close);
            self.drain_in_flight();
            match exit {
                Exit::Dropped => {
                    self.fail_everything();
                    return true;
                }
                Exit::Manual { reconnect } => {
                    if reconnect {
                        continue;
                    }
                    self.set_status(Status::End);
                    self.sink.emit(Event::End);
                    return false;
                }
                Exit::Stream(err) => {
                    if !(self.manually_closing && suppressible(&err)) {
                        self.sink.emit(Event::Error(err.to_string()));
                    }
                    self.attempts += 1;
                    let Some(delay) = (self.config.retry_strategy)(self.attempts) else {
                        self.fail_queued(|| {
                            RedisError::Abort("retry strategy gave up".to_string())
                        });
                        self.set_status(Status::End);
                        self.sink.emit(Event::End);
                        return false;
                    };
                    if let Some(cap) = self.config.max_retries_per_request {
                        if cap > 0 && self.attempts % (cap + 1) == 0 {
                            self.fail_queued(|| RedisError::MaxRetries);
                        }
                    }
                    self.set_status(Status::Reconnecting);
                    self.sink.emit(Event::Reconnecting {
                        attempt: self.attempts,
                        delay,
                    });
                    match self.sleep_with_ops(delay).await {
                        SleepEnd::Continue => {}
                        SleepEnd::Dropped => {
                            self.fail_everything();
                            return true;
                        }
                        SleepEnd::End => {
                            self.set_status(Status::End);
                            self.sink.emit(Event::End);
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// One full connect attempt: dial, handshake, then serve until the
    /// stream ends.
    async fn attempt(&mut self) -> Exit {
        let dial = establish(self.config.clone(), self.resolver.clone());
        let transport = match self.pump(dial).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return Exit::Stream(e),
            Err(exit) => return exit,
        };
        self.set_status(Status::Connect);
        self.sink.emit(Event::Connected);

        let snapshot = SessionSnapshot {
            db: self.db,
            channels: self.subs.list(SubscriptionKind::Channel),
            patterns: self.subs.list(SubscriptionKind::Pattern),
            monitoring: self.monitoring,
        };
        let handshake = ready_handshake(self.config.clone(), Wire::new(transport), snapshot);
        let mut wire = match self.pump(handshake).await {
            Ok(Ok(w)) => w,
            Ok(Err(e)) => return Exit::Stream(e),
            Err(exit) => return exit,
        };

        self.attempts = 0;
        self.set_status(if self.monitoring {
            Status::Monitoring
        } else {
            Status::Ready
        });
        self.sink.emit(Event::Ready);

        if let Err(e) = self.flush_offline(&mut wire).await {
            return Exit::Stream(e);
        }
        self.serve(wire).await
    }

    /// Drive `fut` while still answering queue-affecting ops. `Err` holds
    /// an exit demanded by an op (manual close, handle dropped).
    async fn pump<F, T>(&mut self, fut: F) -> Result<T, Exit>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            let step = {
                let op_rx = &mut self.op_rx;
                tokio::select! {
                    done = &mut fut => Ok(done),
                    op = op_rx.recv() => Err(op),
                }
            };
            match step {
                Ok(value) => return Ok(value),
                Err(None) => return Err(Exit::Dropped),
                Err(Some(op)) => {
                    if let Some(exit) = self.offline_op(op) {
                        return Err(exit);
                    }
                }
            }
        }
    }

    /// Handle an op while no stream is writable.
    fn offline_op(&mut self, op: Op) -> Option<Exit> {
        match op {
            Op::Connect => None,
            Op::Submit(cmd) => {
                self.enqueue_offline(cmd);
                None
            }
            Op::SubmitBatch(cmds) => {
                for cmd in cmds {
                    self.enqueue_offline(cmd);
                }
                None
            }
            Op::Disconnect { reconnect } => {
                self.manually_closing = !reconnect;
                Some(Exit::Manual { reconnect })
            }
        }
    }

    fn enqueue_offline(&mut self, mut cmd: Command) {
        if self.config.enable_offline_queue {
            cmd.db = self.db;
            self.offline.push_back(cmd);
        } else {
            cmd.complete(Err(RedisError::NotWritable));
        }
    }

    /// Replay the offline queue in order, selecting databases as needed.
    async fn flush_offline(&mut self, wire: &mut Wire) -> RedisResult<()> {
        while let Some(cmd) = self.offline.pop_front() {
            if cmd.db != self.db {
                let select = Command::internal("select", vec![Bytes::from(cmd.db.to_string())]);
                self.write_commands(wire, vec![select]).await?;
                self.db = cmd.db;
            }
            self.write_commands(wire, vec![cmd]).await?;
        }
        Ok(())
    }

    async fn serve(&mut self, mut wire: Wire) -> Exit {
        enum Step {
            Op(Option<Op>),
            Read(io::Result<usize>),
        }
        loop {
            let step = {
                let op_rx = &mut self.op_rx;
                let Wire { transport, decoder } = &mut wire;
                tokio::select! {
                    op = op_rx.recv() => Step::Op(op),
                    read = transport.read_buf(decoder.buffer_mut()) => Step::Read(read),
                }
            };
            match step {
                Step::Op(None) => return Exit::Dropped,
                Step::Op(Some(op)) => match op {
                    Op::Connect => {}
                    Op::Disconnect { reconnect } => {
                        self.manually_closing = !reconnect;
                        return Exit::Manual { reconnect };
                    }
                    Op::Submit(cmd) => {
                        if let Err(e) = self.write_commands(&mut wire, vec![cmd]).await {
                            return Exit::Stream(e);
                        }
                    }
                    Op::SubmitBatch(cmds) => {
                        if let Err(e) = self.write_commands(&mut wire, cmds).await {
                            return Exit::Stream(e);
                        }
                    }
                },
                Step::Read(Ok(0)) => {
                    return if self.manually_closing {
                        Exit::Manual { reconnect: false }
                    } else {
                        Exit::Stream(RedisError::ConnectionClosed)
                    };
                }
                Step::Read(Ok(_)) => loop {
                    match wire.decoder.next_reply() {
                        Ok(Some(reply)) => {
                            if let Some(exit) = self.dispatch(reply) {
                                return exit;
                            }
                        }
                        Ok(None) => break,
                        // Malformed RESP is fatal for the connection.
                        Err(e) => return Exit::Stream(e),
                    }
                },
                Step::Read(Err(e)) => return Exit::Stream(e.into()),
            }
        }
    }

    /// Serialise commands into one buffer, flush it once, then append them
    /// to the in-flight FIFO (in that order, so a write failure never
    /// leaves a phantom in-flight entry).
    async fn write_commands(&mut self, wire: &mut Wire, cmds: Vec<Command>) -> RedisResult<()> {
        let mut buf = BytesMut::new();
        let mut accepted: Vec<Command> = Vec::with_capacity(cmds.len());
        for mut cmd in cmds {
            if !cmd.ignore {
                if let Some(err) = self.mode_violation(&cmd) {
                    cmd.complete(Err(err));
                    continue;
                }
            }
            encode_command(&cmd.name, &cmd.args, &mut buf);
            accepted.push(cmd);
        }
        if accepted.is_empty() {
            return Ok(());
        }
        if let Err(e) = wire.transport.write_all(&buf).await {
            for mut cmd in accepted {
                if self.config.auto_resend_unfulfilled_commands {
                    self.offline.push_back(cmd);
                } else {
                    cmd.complete(Err(RedisError::ConnectionClosed));
                }
            }
            return Err(e.into());
        }
        for cmd in accepted {
            self.note_written(cmd);
        }
        Ok(())
    }

    /// Fail commands not allowed in the current mode, before any byte is
    /// written.
    fn mode_violation(&self, cmd: &Command) -> Option<RedisError> {
        if self.monitoring && !cmd.flags.valid_in_monitor_mode {
            return Some(RedisError::MonitorMode);
        }
        if self.subscriber_mode && !cmd.flags.valid_in_subscriber_mode {
            return Some(RedisError::SubscriberMode);
        }
        None
    }

    fn note_written(&mut self, cmd: Command) {
        let expected_subs = match SubscriptionKind::for_command(&cmd.name) {
            Some(kind) => {
                if cmd.flags.enters_subscriber_mode {
                    self.subscriber_mode = true;
                }
                if cmd.args.is_empty() {
                    // A bare unsubscribe acknowledges every member of the
                    // set, or a single null frame when it is empty.
                    self.subs.count(kind).max(1)
                } else {
                    cmd.args.len()
                }
            }
            None => 0,
        };
        self.in_flight.push_back(InFlight {
            cmd,
            expected_subs,
            force_resend: false,
        });
    }

    /// Bind one decoded reply: push frames go out-of-band, confirmations
    /// complete the originating subscribe, everything else completes the
    /// head of the FIFO.
    fn dispatch(&mut self, reply: Reply) -> Option<Exit> {
        if let Some(frame) = as_push_frame(&reply) {
            if self.subscriber_mode || self.head_expects_subscription() {
                self.handle_push(frame);
                return None;
            }
        }
        if self.monitoring {
            if let Reply::Simple(line) = &reply {
                if line.as_bytes().first().is_some_and(u8::is_ascii_digit) {
                    let _ = self.mon_tx.send(line.clone());
                    return None;
                }
            }
        }
        let Some(mut entry) = self.in_flight.pop_front() else {
            warn!(?reply, "reply with no in-flight command");
            return None;
        };
        let result = match reply {
            Reply::Error(msg) => Err(RedisError::reply(&msg)),
            other => Ok(self.postprocess(&entry.cmd, other)),
        };
        if let Err(RedisError::Reply(reply_err)) = &result {
            if let Some(hook) = &self.config.reconnect_on_error {
                match hook(reply_err) {
                    ReconnectDecision::No => {}
                    ReconnectDecision::Reconnect => {
                        entry.cmd.complete(result);
                        return Some(Exit::Stream(RedisError::ConnectionClosed));
                    }
                    ReconnectDecision::ReconnectAndResend => {
                        // Back to the head of the FIFO: the close handler
                        // stashes it ahead of the newer in-flight commands,
                        // preserving submission order.
                        entry.force_resend = true;
                        self.in_flight.push_front(entry);
                        return Some(Exit::Stream(RedisError::ConnectionClosed));
                    }
                }
            }
        }
        if result.is_ok() {
            match entry.cmd.name.as_str() {
                "select" => {
                    if let Some(db) = entry
                        .cmd
                        .args
                        .first()
                        .and_then(|a| std::str::from_utf8(a).ok())
                        .and_then(|a| a.parse::<u32>().ok())
                    {
                        self.db = db;
                    }
                }
                "monitor" => {
                    self.monitoring = true;
                    self.set_status(Status::Monitoring);
                }
                _ => {}
            }
            if entry.cmd.flags.will_disconnect {
                self.manually_closing = true;
            }
        }
        entry.cmd.complete(result);
        None
    }

    fn postprocess(&self, cmd: &Command, reply: Reply) -> Reply {
        let reply = crate::command::transform_reply(&cmd.name, &cmd.args, reply);
        if self.config.stringify_numbers {
            crate::command::stringify_large_numbers(reply)
        } else {
            reply
        }
    }

    fn head_expects_subscription(&self) -> bool {
        self.in_flight
            .front()
            .is_some_and(|entry| entry.expected_subs > 0)
    }

    fn handle_push(&mut self, frame: PushFrame) {
        match frame {
            PushFrame::Message(message) => {
                let _ = self.msg_tx.send(message);
            }
            PushFrame::Confirmation {
                verb,
                channel,
                active,
                raw,
            } => {
                if let Some(kind) = SubscriptionKind::for_command(&verb) {
                    match (verb.starts_with("un"), channel) {
                        (false, Some(channel)) => self.subs.add(kind, channel),
                        (true, Some(channel)) => self.subs.remove(kind, &channel),
                        (true, None) => self.subs.clear(kind),
                        (false, None) => {}
                    }
                }
                self.subscriber_mode = active > 0;
                let complete = match self.in_flight.front_mut() {
                    Some(entry) if entry.expected_subs > 0 => {
                        entry.expected_subs -= 1;
                        entry.expected_subs == 0
                    }
                    _ => false,
                };
                if complete {
                    if let Some(mut entry) = self.in_flight.pop_front() {
                        entry.cmd.complete(Ok(raw));
                    }
                }
            }
        }
    }

    /// On stream loss: either stash in-flight commands for resend or fail
    /// them with `ConnectionClosed`.
    fn drain_in_flight(&mut self) {
        while let Some(mut entry) = self.in_flight.pop_back() {
            let resend = self.config.auto_resend_unfulfilled_commands || entry.force_resend;
            if resend && entry.cmd.is_pending() {
                self.offline.push_front(entry.cmd);
            } else {
                entry.cmd.complete(Err(RedisError::ConnectionClosed));
            }
        }
    }

    fn fail_queued(&mut self, make: impl Fn() -> RedisError) {
        for mut cmd in self.offline.drain(..) {
            cmd.complete(Err(make()));
        }
        for mut entry in self.in_flight.drain(..) {
            entry.cmd.complete(Err(make()));
        }
    }

    fn fail_everything(&mut self) {
        self.fail_queued(|| RedisError::ConnectionClosed);
    }

    async fn sleep_with_ops(&mut self, delay: Duration) -> SleepEnd {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let step = {
                let op_rx = &mut self.op_rx;
                tokio::select! {
                    () = &mut sleep => None,
                    op = op_rx.recv() => Some(op),
                }
            };
            match step {
                None => return SleepEnd::Continue,
                Some(None) => return SleepEnd::Dropped,
                Some(Some(op)) => match self.offline_op(op) {
                    None => {}
                    Some(Exit::Manual { reconnect: true }) => return SleepEnd::Continue,
                    Some(_) => return SleepEnd::End,
                },
            }
        }
    }
}

enum SleepEnd {
    Continue,
    Dropped,
    End,
}

fn suppressible(err: &RedisError) -> bool {
    match err {
        RedisError::ConnectionClosed | RedisError::ConnectTimeout => true,
        RedisError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

enum PushFrame {
    Message(PushMessage),
    Confirmation {
        verb: String,
        channel: Option<String>,
        active: i64,
        raw: Reply,
    },
}

/// Detect subscriber push frames by their leading-element shape.
fn as_push_frame(reply: &Reply) -> Option<PushFrame> {
    let Reply::Array(items) = reply else {
        return None;
    };
    let verb = items.first()?.as_str().ok()?;
    if !PUSH_KINDS.contains(&verb) {
        return None;
    }
    match verb {
        "message" if items.len() == 3 => Some(PushFrame::Message(PushMessage {
            channel: items[1].as_str().ok()?.to_string(),
            pattern: None,
            payload: items[2].clone().into_bytes().ok()?,
        })),
        "pmessage" if items.len() == 4 => Some(PushFrame::Message(PushMessage {
            channel: items[2].as_str().ok()?.to_string(),
            pattern: Some(items[1].as_str().ok()?.to_string()),
            payload: items[3].clone().into_bytes().ok()?,
        })),
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" if items.len() == 3 => {
            let channel = match &items[1] {
                Reply::Null => None,
                other => Some(other.as_str().ok()?.to_string()),
            };
            let active = match items[2] {
                Reply::Integer(n) => n,
                _ => return None,
            };
            Some(PushFrame::Confirmation {
                verb: verb.to_string(),
                channel,
                active,
                raw: reply.clone(),
            })
        }
        _ => None,
    }
}
