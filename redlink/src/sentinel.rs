//! Primary/replica discovery through sentinel observers.
//!
//! A discovery walks the ordered sentinel list until one answers, asks it
//! for the current primary (or a healthy replica), optionally merges
//! gossiped sentinels into its own list, and rewrites the result through
//! the NAT map. A full unsuccessful pass backs off with the configured
//! retry strategy before the next pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use redlink_core::{
    NodeAddr, NodeRole, RedisConfig, RedisError, RedisResult, Reply, SentinelOptions,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::connection::{establish, AddressResolver, ServerTarget, StaticResolver, Wire};

/// Iterates sentinels and remembers gossip between passes.
pub struct SentinelDiscovery {
    options: SentinelOptions,
    sentinels: Vec<NodeAddr>,
}

impl SentinelDiscovery {
    /// Discovery over the configured sentinel list.
    #[must_use]
    pub fn new(options: SentinelOptions) -> Self {
        let sentinels = options.sentinels.clone();
        Self { options, sentinels }
    }

    /// Resolve the configured role, retrying whole passes per the
    /// sentinel retry strategy until it declines.
    pub async fn resolve(&mut self, connect_timeout: Duration) -> RedisResult<NodeAddr> {
        if self.sentinels.is_empty() {
            return Err(RedisError::Config("no sentinels configured".to_string()));
        }
        let mut pass = 0u32;
        loop {
            let list = self.sentinels.clone();
            let mut last_error = String::new();
            for sentinel in &list {
                match self.query(sentinel, connect_timeout).await {
                    Ok(addr) => {
                        let addr = match &self.options.nat_map {
                            Some(nat) => nat.translate(&addr),
                            None => addr,
                        };
                        info!(sentinel = %sentinel, resolved = %addr, "sentinel discovery succeeded");
                        return Ok(addr);
                    }
                    Err(e) => {
                        debug!(sentinel = %sentinel, error = %e, "sentinel did not resolve");
                        last_error = e.to_string();
                    }
                }
            }
            pass += 1;
            let delay = match &self.options.sentinel_retry_strategy {
                Some(strategy) => strategy(pass),
                None => Some(Duration::from_millis(u64::from(pass.min(100)) * 10)),
            };
            let Some(delay) = delay else {
                return Err(RedisError::Sentinel(format!(
                    "all sentinels failed: {last_error}"
                )));
            };
            warn!(pass, ?delay, "sentinel pass failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    async fn query(
        &mut self,
        sentinel: &NodeAddr,
        connect_timeout: Duration,
    ) -> RedisResult<NodeAddr> {
        let mut config = RedisConfig::new(sentinel.host.clone(), sentinel.port);
        config.connect_timeout = connect_timeout;
        config.tls = self.options.enable_tls_for_sentinel_mode;
        let resolver = StaticResolver::from_config(&config);
        let transport = establish(config, resolver).await?;
        let mut wire = Wire::new(transport);

        if self.options.update_sentinels {
            if let Err(e) = self.merge_gossip(&mut wire).await {
                debug!(error = %e, "sentinel gossip merge failed");
            }
        }

        match self.options.role {
            NodeRole::Primary => self.query_primary(&mut wire).await,
            NodeRole::Replica => self.query_replica(&mut wire).await,
        }
    }

    async fn query_primary(&mut self, wire: &mut Wire) -> RedisResult<NodeAddr> {
        let reply = wire
            .request(
                "sentinel",
                &[
                    Bytes::from_static(b"get-master-addr-by-name"),
                    Bytes::copy_from_slice(self.options.name.as_bytes()),
                ],
            )
            .await?;
        let Reply::Array(parts) = reply else {
            return Err(RedisError::Sentinel(format!(
                "service {} is not monitored",
                self.options.name
            )));
        };
        if parts.len() != 2 {
            return Err(RedisError::Sentinel(
                "malformed get-master-addr-by-name reply".to_string(),
            ));
        }
        let host = parts[0]
            .as_str()
            .map_err(|_| RedisError::Sentinel("master host is not a string".to_string()))?;
        let port = parts[1].as_int()?;
        let port = u16::try_from(port)
            .map_err(|_| RedisError::Sentinel(format!("master port {port} out of range")))?;
        Ok(NodeAddr::new(host, port))
    }

    async fn query_replica(&mut self, wire: &mut Wire) -> RedisResult<NodeAddr> {
        let reply = wire
            .request(
                "sentinel",
                &[
                    Bytes::from_static(b"slaves"),
                    Bytes::copy_from_slice(self.options.name.as_bytes()),
                ],
            )
            .await?;
        let Reply::Array(entries) = reply else {
            return Err(RedisError::Sentinel("malformed slaves reply".to_string()));
        };
        let mut healthy = Vec::new();
        for entry in &entries {
            let Reply::Array(pairs) = entry else { continue };
            let fields = pairs_to_fields(pairs);
            let down = fields
                .get("flags")
                .is_some_and(|f| f.contains("s_down") || f.contains("o_down"));
            if down {
                continue;
            }
            if let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) {
                if let Ok(port) = port.parse::<u16>() {
                    healthy.push(NodeAddr::new(ip.clone(), port));
                }
            }
        }
        healthy
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                RedisError::Sentinel(format!(
                    "no healthy replica for service {}",
                    self.options.name
                ))
            })
    }

    /// Append sentinels gossiped by this observer, preserving order and
    /// skipping duplicates.
    async fn merge_gossip(&mut self, wire: &mut Wire) -> RedisResult<()> {
        let reply = wire
            .request(
                "sentinel",
                &[
                    Bytes::from_static(b"sentinels"),
                    Bytes::copy_from_slice(self.options.name.as_bytes()),
                ],
            )
            .await?;
        let Reply::Array(entries) = reply else {
            return Ok(());
        };
        for entry in &entries {
            let Reply::Array(pairs) = entry else { continue };
            let fields = pairs_to_fields(pairs);
            if let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) {
                if let Ok(port) = port.parse::<u16>() {
                    let addr = NodeAddr::new(ip.clone(), port);
                    if !self.sentinels.contains(&addr) {
                        debug!(sentinel = %addr, "learned sentinel from gossip");
                        self.sentinels.push(addr);
                    }
                }
            }
        }
        Ok(())
    }

    /// The current list, configuration order first, gossip after.
    #[must_use]
    pub fn sentinels(&self) -> &[NodeAddr] {
        &self.sentinels
    }
}

fn pairs_to_fields(pairs: &[Reply]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for chunk in pairs.chunks(2) {
        if let [field, value] = chunk {
            if let (Ok(f), Ok(v)) = (field.as_str(), value.as_str()) {
                fields.insert(f.to_string(), v.to_string());
            }
        }
    }
    fields
}

/// One-shot resolution, for callers that do not need to keep gossip state.
pub async fn resolve(
    options: &SentinelOptions,
    connect_timeout: Duration,
) -> RedisResult<NodeAddr> {
    SentinelDiscovery::new(options.clone())
        .resolve(connect_timeout)
        .await
}

/// Address resolver that re-runs discovery before every connect attempt,
/// so reconnects land on the current primary after a failover.
pub struct SentinelResolver {
    discovery: AsyncMutex<SentinelDiscovery>,
    connect_timeout: Duration,
    tls: bool,
}

impl SentinelResolver {
    /// Resolver for the sentinel block of `config`.
    ///
    /// # Errors
    ///
    /// Fails when the configuration has no sentinel block.
    pub fn from_config(config: &RedisConfig) -> RedisResult<Arc<dyn AddressResolver>> {
        let options = config
            .sentinel
            .clone()
            .ok_or_else(|| RedisError::Config("sentinel block missing".to_string()))?;
        Ok(Arc::new(Self {
            discovery: AsyncMutex::new(SentinelDiscovery::new(options)),
            connect_timeout: config.connect_timeout,
            tls: config.tls,
        }))
    }
}

#[async_trait]
impl AddressResolver for SentinelResolver {
    async fn resolve(&self) -> RedisResult<ServerTarget> {
        let mut discovery = self.discovery.lock().await;
        let addr = discovery.resolve(self.connect_timeout).await?;
        Ok(ServerTarget::Tcp {
            host: addr.host,
            port: addr.port,
            tls: self.tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_pairs_parse() {
        let pairs = vec![
            Reply::bulk("name"),
            Reply::bulk("mymaster"),
            Reply::bulk("ip"),
            Reply::bulk("10.0.0.5"),
            Reply::bulk("port"),
            Reply::bulk("6379"),
            Reply::bulk("flags"),
            Reply::bulk("slave"),
        ];
        let fields = pairs_to_fields(&pairs);
        assert_eq!(fields.get("ip").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(fields.get("flags").map(String::as_str), Some("slave"));
    }

    #[tokio::test]
    async fn empty_sentinel_list_is_a_config_error() {
        let options = SentinelOptions::new("mymaster", Vec::new());
        let mut discovery = SentinelDiscovery::new(options);
        let err = discovery
            .resolve(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RedisError::Config(_)));
    }

    #[tokio::test]
    async fn declining_retry_strategy_surfaces_sentinel_error() {
        let options = SentinelOptions::new(
            "mymaster",
            vec![NodeAddr::new("127.0.0.1", 1)],
        )
        .with_retry_strategy(Arc::new(|_| None));
        let mut discovery = SentinelDiscovery::new(options);
        let err = discovery
            .resolve(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RedisError::Sentinel(_)), "got {err:?}");
    }
}
