//! Cluster routing and orchestration.
//!
//! The [`ClusterClient`] keeps a slot map and a [`ConnectionPool`], routes
//! every command by its keys, follows MOVED/ASK redirections, backs off on
//! TRYAGAIN/CLUSTERDOWN, and refreshes the map (coalesced, at most one
//! `CLUSTER SLOTS` in flight) whenever the topology shifts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use redlink_core::{
    ClusterConfig, NodeAddr, NodeRole, RedisError, RedisResult, Reply, ReplyErrorKind, ScaleReads,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::connection::Connection;
use crate::events::{Event, EventSink, ForwardSink, NullSink};
use crate::pipeline::{batch_retry_error, BatchCommand, BatchExecutor, Pipeline};
use crate::pool::ConnectionPool;
use crate::slots::{key_slot, SlotMap, SLOT_COUNT};

struct ClusterInner {
    config: ClusterConfig,
    pool: ConnectionPool,
    slots: RwLock<Arc<SlotMap>>,
    /// Instant of the last finished refresh; requesters that queued before
    /// it simply adopt its outcome.
    refresh_gate: AsyncMutex<Instant>,
    closed: AtomicBool,
}

/// Client for a sharded deployment.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    /// Boot against the configured seed nodes and build the first slot
    /// map. Fails with `ClusterAllFailed` when no seed answers.
    pub async fn connect(config: ClusterConfig) -> RedisResult<Self> {
        Self::connect_with_sink(config, Arc::new(NullSink)).await
    }

    /// Boot with a caller-supplied event sink.
    pub async fn connect_with_sink(
        config: ClusterConfig,
        sink: Arc<dyn EventSink>,
    ) -> RedisResult<Self> {
        let seeds = Self::boot_seeds(&config).await?;
        if seeds.is_empty() {
            return Err(RedisError::Config("no cluster seed nodes".to_string()));
        }
        let (sink, mut events) = ForwardSink::new(sink);
        let pool = ConnectionPool::new(config.redis.clone(), sink);
        let inner = Arc::new(ClusterInner {
            config,
            pool,
            slots: RwLock::new(Arc::new(SlotMap::new())),
            refresh_gate: AsyncMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });
        let client = Self { inner };

        client.initial_refresh(&seeds).await?;

        // Topology reactions: a vanished node invalidates routings that
        // referenced it; an empty pool closes the cluster.
        let watcher = client.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::NodeRemoved(key) => {
                        debug!(node = %key, "node left, scheduling slot refresh");
                        watcher.schedule_refresh();
                    }
                    Event::Drain => {
                        info!("connection pool drained, closing cluster");
                        watcher.inner.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                    _ => {}
                }
            }
        });

        if let Some(interval) = client.inner.config.slots_refresh_interval {
            let periodic = client.clone();
            tokio::spawn(async move {
                loop {
                    sleep(interval).await;
                    if periodic.is_closed() {
                        return;
                    }
                    if let Err(e) = periodic.refresh_slots().await {
                        warn!(error = %e, "periodic slot refresh failed");
                    }
                }
            });
        }

        Ok(client)
    }

    /// Seed list, resolved through sentinels when configured.
    async fn boot_seeds(config: &ClusterConfig) -> RedisResult<Vec<NodeAddr>> {
        match &config.redis.sentinel {
            Some(options) => {
                let addr =
                    crate::sentinel::resolve(options, config.redis.connect_timeout).await?;
                Ok(vec![addr])
            }
            None => Ok(config.seeds.clone()),
        }
    }

    /// Walk the seed list until one yields a slot map.
    async fn initial_refresh(&self, seeds: &[NodeAddr]) -> RedisResult<()> {
        let mut last_error = "no seed answered".to_string();
        for seed in seeds {
            let conn = self
                .inner
                .pool
                .find_or_create(seed, NodeRole::Primary);
            match self.fetch_slots(&conn).await {
                Ok(map) => {
                    self.apply_map(map);
                    return Ok(());
                }
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed did not produce a slot map");
                    last_error = format!("{seed}: {e}");
                }
            }
        }
        self.inner.pool.disconnect_all();
        Err(RedisError::ClusterAllFailed(last_error))
    }

    /// One `CLUSTER SLOTS` exchange over an existing connection.
    async fn fetch_slots(&self, conn: &Connection) -> RedisResult<SlotMap> {
        let (cmd, rx) = Command::new("cluster", vec![Bytes::from_static(b"slots")]);
        conn.send(cmd);
        let reply = timeout(self.inner.config.slots_refresh_timeout, rx)
            .await
            .map_err(|_| RedisError::ConnectTimeout)?
            .unwrap_or(Err(RedisError::ConnectionClosed))?;
        SlotMap::from_cluster_slots(&reply, self.inner.config.nat_map.as_ref())
    }

    fn apply_map(&self, map: SlotMap) {
        let primaries = map.primary_keys();
        let mut membership = Vec::new();
        for key in map.node_keys() {
            if let Some(addr) = map.addr_of(&key) {
                let role = if primaries.contains(&key) {
                    NodeRole::Primary
                } else {
                    NodeRole::Replica
                };
                membership.push((addr.clone(), role));
            }
        }
        *self.inner.slots.write().expect("slot map poisoned") = Arc::new(map);
        self.inner.pool.reset(&membership);
    }

    /// Refresh the slot map now. Concurrent callers coalesce onto one
    /// `CLUSTER SLOTS` exchange.
    pub async fn refresh_slots(&self) -> RedisResult<()> {
        let requested = Instant::now();
        let mut gate = self.inner.refresh_gate.lock().await;
        if *gate > requested {
            // Somebody refreshed while we waited for the gate.
            return Ok(());
        }
        let sampled = self
            .inner
            .pool
            .sample_any()
            .ok_or_else(|| RedisError::ClusterAllFailed("pool is empty".to_string()))?;
        let result = self.fetch_slots(&sampled.1).await;
        *gate = Instant::now();
        drop(gate);
        match result {
            Ok(map) => {
                info!(nodes = map.node_keys().len(), "slot map refreshed");
                self.apply_map(map);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fire-and-forget refresh used on redirects.
    fn schedule_refresh(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            if client.is_closed() {
                return;
            }
            if let Err(e) = client.refresh_slots().await {
                warn!(error = %e, "slot refresh failed");
            }
        });
    }

    fn slot_map(&self) -> Arc<SlotMap> {
        self.inner.slots.read().expect("slot map poisoned").clone()
    }

    /// Patch one slot after a MOVED reply; the full refresh follows
    /// asynchronously.
    fn learn_moved(&self, slot: u16, addr: &NodeAddr) {
        let mut guard = self.inner.slots.write().expect("slot map poisoned");
        *guard = Arc::new(guard.with_moved(slot, addr));
    }

    /// True once the pool drained or `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Disconnect every node and refuse further commands.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pool.disconnect_all();
    }

    /// Pick the node serving `slot`, honouring the read policy.
    fn pick_node(
        &self,
        slot: Option<u16>,
        cmd_name: &str,
        readonly: bool,
        in_tx: bool,
    ) -> RedisResult<NodeAddr> {
        let map = self.slot_map();
        if map.is_empty() {
            return Err(RedisError::ClusterAllFailed(
                "slot map has no coverage".to_string(),
            ));
        }
        let key = match slot {
            None => {
                let primaries: Vec<String> = map.primary_keys().into_iter().collect();
                let i = rand::thread_rng().gen_range(0..primaries.len());
                primaries[i].clone()
            }
            Some(slot) => {
                let primary = map
                    .primary_of(slot)
                    .ok_or_else(|| {
                        RedisError::ClusterAllFailed(format!("slot {slot} has no owner"))
                    })?
                    .to_string();
                let replicas = map.replicas_of(slot);
                if !readonly || in_tx {
                    primary
                } else {
                    match &self.inner.config.scale_reads {
                        ScaleReads::Master => primary,
                        ScaleReads::Slave if !replicas.is_empty() => {
                            let i = rand::thread_rng().gen_range(0..replicas.len());
                            replicas[i].clone()
                        }
                        ScaleReads::All if !replicas.is_empty() => {
                            let mut pool_of: Vec<&String> = replicas.iter().collect();
                            pool_of.push(&primary);
                            let i = rand::thread_rng().gen_range(0..pool_of.len());
                            pool_of[i].clone()
                        }
                        ScaleReads::Custom(pick) => {
                            let mut candidates = Vec::with_capacity(replicas.len() + 1);
                            for key in std::iter::once(&primary).chain(replicas.iter()) {
                                if let Some(addr) = map.addr_of(key) {
                                    candidates.push(addr.clone());
                                }
                            }
                            if candidates.is_empty() {
                                primary
                            } else {
                                return Ok(pick(&candidates, cmd_name));
                            }
                        }
                        _ => primary,
                    }
                }
            }
        };
        map.addr_of(&key)
            .cloned()
            .ok_or_else(|| RedisError::ClusterAllFailed(format!("unknown node {key}")))
    }

    fn role_for(&self, addr: &NodeAddr) -> NodeRole {
        let map = self.slot_map();
        if map.primary_keys().contains(&addr.key()) {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        }
    }

    /// Route one command, following redirections up to the configured cap.
    pub(crate) async fn route_command(&self, desc: &BatchCommand) -> RedisResult<Reply> {
        if self.is_closed() {
            return Err(RedisError::ConnectionClosed);
        }
        let slot = crate::slots::slot_for_keys(desc.command_keys())
            .ok_or(RedisError::CrossSlot)?;
        let config = &self.inner.config;
        let mut remaining = config.max_redirections;
        let mut prefer: Option<NodeAddr> = None;
        let mut asking = false;

        loop {
            let addr = match prefer.take() {
                Some(addr) => addr,
                None => self.pick_node(slot, &desc.name, desc.flags.is_readonly, false)?,
            };
            let conn = self.inner.pool.find_or_create(&addr, self.role_for(&addr));
            if asking {
                conn.send(Command::internal("asking", Vec::new()));
            }
            let (cmd, rx) = desc.to_command();
            conn.send(cmd);
            let outcome = rx.await.unwrap_or(Err(RedisError::ConnectionClosed));
            let err = match outcome {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_cluster_retriable() => err,
                Err(err) => return Err(err),
            };
            if remaining == 0 {
                return Err(RedisError::MaxRedirections);
            }
            remaining -= 1;
            asking = false;
            match err.reply_kind() {
                Some(ReplyErrorKind::Moved { slot, addr: target }) => {
                    debug!(slot, target = %target, "following MOVED");
                    self.learn_moved(*slot, target);
                    prefer = Some(target.clone());
                    self.schedule_refresh();
                    if !config.retry_delay_on_moved.is_zero() {
                        sleep(config.retry_delay_on_moved).await;
                    }
                }
                Some(ReplyErrorKind::Ask { addr: target, .. }) => {
                    debug!(target = %target, "following ASK");
                    prefer = Some(target.clone());
                    asking = true;
                }
                Some(ReplyErrorKind::TryAgain) => {
                    prefer = Some(addr);
                    sleep(config.retry_delay_on_try_again).await;
                }
                Some(ReplyErrorKind::ClusterDown) => {
                    self.schedule_refresh();
                    sleep(config.retry_delay_on_try_again).await;
                }
                // Lost connection: refresh and re-route from the map.
                _ => self.schedule_refresh(),
            }
        }
    }

    /// Non-atomic pipeline routed as one single-slot batch.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(self.clone()), false).with_key_prefix(self.key_prefix())
    }

    /// `MULTI`/`EXEC` transaction routed as one single-slot batch.
    #[must_use]
    pub fn multi(&self) -> Pipeline {
        Pipeline::new(Arc::new(self.clone()), true).with_key_prefix(self.key_prefix())
    }

    /// Key prefix from the per-node template, applied before slots are
    /// computed.
    #[must_use]
    pub(crate) fn key_prefix(&self) -> Option<String> {
        self.inner.config.redis.key_prefix.clone()
    }
}

#[async_trait]
impl BatchExecutor for ClusterClient {
    fn cluster_mode(&self) -> bool {
        true
    }

    /// Submit a whole batch to the slot's node, retrying the batch as a
    /// unit when every error is the same retriable failure.
    async fn execute(&self, batch: Vec<BatchCommand>) -> RedisResult<Vec<RedisResult<Reply>>> {
        if self.is_closed() {
            return Err(RedisError::ConnectionClosed);
        }
        if batch.iter().any(|c| c.flags.is_custom) {
            return Err(RedisError::CustomInPipeline);
        }
        // The single-slot invariant, checked before any byte is written.
        let mut slot: Option<u16> = None;
        for cmd in &batch {
            for key in cmd.command_keys() {
                let s = key_slot(key);
                match slot {
                    None => slot = Some(s),
                    Some(prev) if prev != s => return Err(RedisError::CrossSlot),
                    Some(_) => {}
                }
            }
        }
        let slot = slot.unwrap_or_else(|| rand::thread_rng().gen_range(0..SLOT_COUNT));
        let in_tx = batch.iter().any(|c| c.name == "multi");
        let all_readonly = batch
            .iter()
            .all(|c| c.flags.is_readonly || c.name == "multi" || c.name == "exec");
        // Read routing (including a custom picker) sees the first real
        // command of the batch.
        let batch_name = batch
            .iter()
            .find(|c| c.name != "multi" && c.name != "exec")
            .map_or("exec", |c| c.name.as_str());

        let config = &self.inner.config;
        let mut remaining = config.max_redirections;
        let mut prefer: Option<NodeAddr> = None;
        let mut asking = false;

        loop {
            let addr = match prefer.take() {
                Some(addr) => addr,
                None => self.pick_node(Some(slot), batch_name, all_readonly, in_tx)?,
            };
            let conn = self.inner.pool.find_or_create(&addr, self.role_for(&addr));

            let mut cmds = Vec::with_capacity(batch.len() + 1);
            if asking {
                cmds.push(Command::internal("asking", Vec::new()));
            }
            let mut receivers = Vec::with_capacity(batch.len());
            for desc in &batch {
                let (cmd, rx) = desc.to_command();
                cmds.push(cmd);
                receivers.push(rx);
            }
            conn.send_batch(cmds);

            let mut results = Vec::with_capacity(receivers.len());
            for rx in receivers {
                results.push(rx.await.unwrap_or(Err(RedisError::ConnectionClosed)));
            }

            let Some(err) = batch_retry_error(&batch, &results, in_tx) else {
                return Ok(results);
            };
            if remaining == 0 {
                return Err(RedisError::MaxRedirections);
            }
            remaining -= 1;
            asking = false;
            match err.reply_kind() {
                Some(ReplyErrorKind::Moved { slot, addr: target }) => {
                    let target = target.clone();
                    self.learn_moved(*slot, &target);
                    prefer = Some(target);
                    self.schedule_refresh();
                    if !config.retry_delay_on_moved.is_zero() {
                        sleep(config.retry_delay_on_moved).await;
                    }
                }
                Some(ReplyErrorKind::Ask { addr: target, .. }) => {
                    prefer = Some(target.clone());
                    asking = true;
                }
                Some(ReplyErrorKind::TryAgain) => {
                    prefer = Some(addr);
                    sleep(config.retry_delay_on_try_again).await;
                }
                Some(ReplyErrorKind::ClusterDown) => {
                    self.schedule_refresh();
                    sleep(config.retry_delay_on_try_again).await;
                }
                _ => self.schedule_refresh(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_reads_defaults_to_master() {
        let config = ClusterConfig::new(vec![NodeAddr::new("127.0.0.1", 7000)]);
        assert!(matches!(config.scale_reads, ScaleReads::Master));
        assert_eq!(config.max_redirections, 16);
    }

    #[test]
    fn random_slot_is_in_range() {
        for _ in 0..64 {
            let slot = rand::thread_rng().gen_range(0..SLOT_COUNT);
            assert!(slot < SLOT_COUNT);
        }
    }
}
