//! Configuration options for the relay core

use crate::auth::TrustLevel;
use std::collections::HashSet;

/// Main configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// URL of the relay (used for NIP-42 auth validation)
    pub relay_url: String,
    /// Maximum number of active subscriptions per connection
    pub max_subscriptions: usize,
    /// Maximum limit value allowed in subscription filters
    pub max_filter_limit: usize,
    /// Limit applied when a filter carries none (or a non-positive one)
    pub default_filter_limit: usize,
    /// How far an authentication event's created_at may drift from server
    /// time, in seconds, in either direction
    pub auth_window_seconds: u64,
    /// Refuse re-authentication to a different pubkey on an already
    /// authenticated connection
    pub restrict_reauthentication: bool,
    /// Lowercase hex pubkeys granted the trusted-author tier
    pub trusted_authors: HashSet<String>,
    /// Minimum trust tier required to complete authentication
    pub min_trust_level: TrustLevel,
    /// Capacity of the accepted-event fanout queue
    pub fanout_queue_size: usize,
}

impl RelayConfig {
    /// Create a new relay configuration with defaults
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            max_subscriptions: 50,
            max_filter_limit: 5000,
            default_filter_limit: 500,
            auth_window_seconds: 600,
            restrict_reauthentication: false,
            trusted_authors: HashSet::new(),
            min_trust_level: TrustLevel::BASE,
            fanout_queue_size: 4096,
        }
    }

    /// Set the maximum number of active subscriptions per connection
    pub fn with_max_subscriptions(mut self, max_subscriptions: usize) -> Self {
        self.max_subscriptions = max_subscriptions;
        self
    }

    /// Set the maximum limit value allowed in subscription filters
    pub fn with_max_filter_limit(mut self, max_filter_limit: usize) -> Self {
        self.max_filter_limit = max_filter_limit;
        self
    }

    /// Set the limit applied to filters that don't carry one
    pub fn with_default_filter_limit(mut self, default_filter_limit: usize) -> Self {
        self.default_filter_limit = default_filter_limit;
        self
    }

    /// Set max_subscriptions and max_filter_limit
    pub fn with_subscription_limits(
        mut self,
        max_subscriptions: usize,
        max_filter_limit: usize,
    ) -> Self {
        self.max_subscriptions = max_subscriptions;
        self.max_filter_limit = max_filter_limit;
        self
    }

    /// Set the authentication recency window in seconds
    pub fn with_auth_window(mut self, seconds: u64) -> Self {
        self.auth_window_seconds = seconds;
        self
    }

    /// Refuse re-authentication to a different pubkey
    pub fn with_restricted_reauthentication(mut self) -> Self {
        self.restrict_reauthentication = true;
        self
    }

    /// Set the trusted-author set (hex pubkeys, normalized to lowercase)
    pub fn with_trusted_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_authors = authors
            .into_iter()
            .map(|a| a.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Require at least the given trust tier to complete authentication
    pub fn with_min_trust_level(mut self, level: TrustLevel) -> Self {
        self.min_trust_level = level;
        self
    }

    /// Calculate the per-connection outbound channel size.
    /// Worst case is a single subscription requesting max_filter_limit
    /// events, plus overhead for control messages (EOSE, notices, etc.)
    pub fn calculate_channel_size(&self) -> usize {
        let overhead = 5;
        self.max_subscriptions * (self.max_filter_limit + overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = RelayConfig::new("wss://relay.example.com")
            .with_subscription_limits(10, 100)
            .with_auth_window(300)
            .with_restricted_reauthentication()
            .with_trusted_authors(["ABCDEF"]);

        assert_eq!(config.max_subscriptions, 10);
        assert_eq!(config.max_filter_limit, 100);
        assert_eq!(config.auth_window_seconds, 300);
        assert!(config.restrict_reauthentication);
        assert!(config.trusted_authors.contains("abcdef"));
        assert_eq!(config.calculate_channel_size(), 10 * 105);
    }
}
