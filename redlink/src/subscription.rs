//! Tracks what the connection is subscribed to, for replay on reconnect.

use std::collections::BTreeSet;

/// Which of the two disjoint subscription sets a channel belongs to.
///
/// `unsubscribe` addresses the same set as `subscribe`, `punsubscribe` the
/// same set as `psubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Plain channel subscriptions.
    Channel,
    /// Glob pattern subscriptions.
    Pattern,
}

impl SubscriptionKind {
    /// Map a command name onto the set it mutates.
    #[must_use]
    pub fn for_command(name: &str) -> Option<Self> {
        match name {
            "subscribe" | "unsubscribe" => Some(Self::Channel),
            "psubscribe" | "punsubscribe" => Some(Self::Pattern),
            _ => None,
        }
    }
}

/// The channel and pattern sets of one connection.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl SubscriptionSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_mut(&mut self, kind: SubscriptionKind) -> &mut BTreeSet<String> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    fn set(&self, kind: SubscriptionKind) -> &BTreeSet<String> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    /// Record a subscription.
    pub fn add(&mut self, kind: SubscriptionKind, channel: impl Into<String>) {
        self.set_mut(kind).insert(channel.into());
    }

    /// Drop a subscription.
    pub fn remove(&mut self, kind: SubscriptionKind, channel: &str) {
        self.set_mut(kind).remove(channel);
    }

    /// Drop everything in one set (a bare `unsubscribe`).
    pub fn clear(&mut self, kind: SubscriptionKind) {
        self.set_mut(kind).clear();
    }

    /// The members of one set, in iteration order.
    #[must_use]
    pub fn list(&self, kind: SubscriptionKind) -> Vec<String> {
        self.set(kind).iter().cloned().collect()
    }

    /// Number of active subscriptions in one set.
    #[must_use]
    pub fn count(&self, kind: SubscriptionKind) -> usize {
        self.set(kind).len()
    }

    /// True when neither set has members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}
